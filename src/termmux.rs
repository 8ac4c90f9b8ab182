// The 2236 MXD terminal mux card: an embedded 8080 with EPROM and RAM,
// four RS-232 ports, an RBI (ready/busy) register visible to the 2200, and
// edge latches for the OBS/CBS/PRIME strobes.  The function is emulated at
// the chip level, so the card is only as smart as the EPROM image it runs;
// without one it executes a zero-filled (NOP) store, which still exercises
// the plumbing.
//
// The low 3 bits of the Wang address select a port/register offset the
// 8080 can read.  The 8080 polls uart rx/tx status through input ports and
// moves bytes through output ports; each uart is a little shared cell the
// attached terminal reads and writes from the far end of the serial line.

use crate::devices::IoCard;
use crate::i8080::{Bus8080, I8080};
use crate::processor::CpuLinesPtr;
use crate::scheduler::{arm_timer, SchedulerPtr};
use crate::terminal::{serial_char_delay, Terminal, TerminalPtr};
use log::{debug, warn};
use std::cell::RefCell;
use std::rc::Rc;

// the 8080 runs at 1.78 MHz
const NS_PER_8080_TICK: u32 = 561;

pub const MAX_TERMINALS: usize = 4;

const EPROM_SIZE: usize = 0x4000; // 16 KB window at 0x0000
const RAM_BASE: u16 = 0x4000;
const RAM_SIZE: usize = 0x0800; // 2 KB

// input port map
const IN_UART_TXRDY: u8 = 0x00; //  which uarts have room to transmit
const IN_2200_STATUS: u8 = 0x01; // strobe/selection status bits
                                 //   0x01 = OBS strobe seen
                                 //   0x02 = CBS strobe seen
                                 //   0x04 = PRIME strobe seen (cleared by OUT 0)
                                 //   0x08 = selected and the CPU waits for input
                                 //   0x10 = board selected at time of ABS
                                 //   0x20..0x80 = AB1..AB3 at time of ABS
const IN_OBUS_N: u8 = 0x02; //      read !OB bus, clear the obs/cbs status
const IN_OBSCBS_ADDR: u8 = 0x03; // [7:5] = address offset at obs/cbs time, active low
const IN_UART_RXRDY: u8 = 0x04; //  which uarts hold a received byte
const IN_UART_DATA: u8 = 0x06; //   selected uart rx data
const IN_UART_STATUS: u8 = 0x0E; // selected uart status
                                 //   0x04 = TxEMPTY, 0x02 = RxRDY, 0x01 = TxRDY

// output port map
const OUT_CLR_PRIME: u8 = 0x00; //  clears the reset latch
const OUT_IB_N: u8 = 0x01; //       drive !IB1-!IB8 and pulse IBS
const OUT_IB9_N: u8 = 0x11; //      same, plus IB9 (the KFN bit)
const OUT_PRIME: u8 = 0x02; //      fires the !PRIME strobe
const OUT_HALT_STEP: u8 = 0x03; //  one-shot halt/step strobe to the CPU
const OUT_UART_SEL: u8 = 0x05; //   one-hot uart chip select
const OUT_UART_DATA: u8 = 0x06; //  write the selected uart tx register
const OUT_RBI: u8 = 0x07; //        0=ready/1=busy per address offset
const OUT_UART_CMD: u8 = 0x0E; //   selected uart command register

// one serial line endpoint; the terminal sits on the far side
pub struct UartPort {
    pub rx_ready: bool, // terminal -> mxd: a byte is waiting
    pub rx_byte: u8,
    pub tx_busy: bool, // mxd -> terminal: serializer still shifting
}

pub type UartPortPtr = Rc<RefCell<UartPort>>;

pub struct Mxd {
    scheduler: SchedulerPtr,
    lines: CpuLinesPtr,
    baseaddr: u8,

    selected: bool,
    cpb: bool,
    io_offset: u8,
    prime_seen: bool,
    obs_seen: bool,
    cbs_seen: bool,
    obscbs_offset: u8,
    obscbs_data: u8,
    rbi: u8,
    uart_sel: usize,

    eprom: Vec<u8>,
    ram: Vec<u8>,
    ports: Vec<UartPortPtr>,
    terms: Vec<TerminalPtr>,
}

impl Mxd {
    // the board's ready/busy status, driven only while selected
    fn update_rbi(&mut self) {
        if self.io_offset == 0 || !self.selected {
            return;
        }
        let busy = ((self.obs_seen || self.cbs_seen) && self.io_offset >= 4)
            || (self.rbi >> (self.io_offset - 1)) & 1 != 0;
        self.lines.borrow_mut().set_dev_rdy(!busy);
    }

    fn interrupt_pending(&self) -> bool {
        self.ports.iter().any(|p| p.borrow().rx_ready)
    }

    // transmit one byte toward the selected terminal, modeling the
    // serialization time before the glyphs appear
    fn uart_transmit(&mut self, val: u8) {
        let sel = self.uart_sel;
        if sel >= self.terms.len() {
            return;
        }
        let port = Rc::clone(&self.ports[sel]);
        if port.borrow().tx_busy {
            warn!("mxd wrote uart {} while the serializer was busy", sel);
            return;
        }
        port.borrow_mut().tx_busy = true;
        let term = Rc::clone(&self.terms[sel]);
        arm_timer(&self.scheduler, serial_char_delay(), move || {
            port.borrow_mut().tx_busy = false;
            term.borrow_mut().process_char(val);
        });
    }
}

impl Bus8080 for Mxd {
    fn mem_read(&mut self, addr: u16) -> u8 {
        let a = addr as usize;
        if a < EPROM_SIZE {
            self.eprom[a]
        } else if (RAM_BASE as usize..RAM_BASE as usize + RAM_SIZE).contains(&a) {
            self.ram[a - RAM_BASE as usize]
        } else {
            0xFF
        }
    }

    fn mem_write(&mut self, addr: u16, val: u8) {
        let a = addr as usize;
        if (RAM_BASE as usize..RAM_BASE as usize + RAM_SIZE).contains(&a) {
            self.ram[a - RAM_BASE as usize] = val;
        }
    }

    fn port_in(&mut self, port: u8) -> u8 {
        match port {
            IN_UART_TXRDY => {
                let mut v = 0;
                for (n, p) in self.ports.iter().enumerate() {
                    if !p.borrow().tx_busy {
                        v |= 1 << n;
                    }
                }
                v
            }
            IN_2200_STATUS => {
                (self.obs_seen as u8)
                    | (self.cbs_seen as u8) << 1
                    | (self.prime_seen as u8) << 2
                    | ((self.selected && !self.cpb) as u8) << 3
                    | (self.selected as u8) << 4
                    | (self.io_offset & 7) << 5
            }
            IN_OBUS_N => {
                let v = !self.obscbs_data;
                self.obs_seen = false;
                self.cbs_seen = false;
                self.update_rbi();
                v
            }
            IN_OBSCBS_ADDR => !(self.obscbs_offset << 5),
            IN_UART_RXRDY => {
                let mut v = 0;
                for (n, p) in self.ports.iter().enumerate() {
                    if p.borrow().rx_ready {
                        v |= 1 << n;
                    }
                }
                v
            }
            IN_UART_DATA => {
                let mut p = self.ports[self.uart_sel].borrow_mut();
                p.rx_ready = false;
                p.rx_byte
            }
            IN_UART_STATUS => {
                let p = self.ports[self.uart_sel].borrow();
                let tx_free = (!p.tx_busy) as u8;
                (tx_free << 2) | ((p.rx_ready as u8) << 1) | tx_free
            }
            _ => 0xFF,
        }
    }

    fn port_out(&mut self, port: u8, val: u8) {
        match port {
            OUT_CLR_PRIME => self.prime_seen = false,
            OUT_IB_N => {
                // data rides the bus inverted; IBS only matters when the
                // CPU is actually waiting on the selected board
                if self.selected && !self.cpb {
                    self.lines.borrow_mut().ibs(!val, false);
                }
            }
            OUT_IB9_N => {
                if self.selected && !self.cpb {
                    self.lines.borrow_mut().ibs(!val, true);
                }
            }
            OUT_PRIME => {
                for p in &self.ports {
                    let mut p = p.borrow_mut();
                    p.rx_ready = false;
                    p.tx_busy = false;
                }
                self.obs_seen = false;
                self.cbs_seen = false;
            }
            OUT_HALT_STEP => self.lines.borrow_mut().halt(),
            OUT_UART_SEL => {
                self.uart_sel = match val & 0x0F {
                    0x01 => 0,
                    0x02 => 1,
                    0x04 => 2,
                    0x08 => 3,
                    _ => self.uart_sel,
                };
            }
            OUT_UART_DATA => self.uart_transmit(val),
            OUT_RBI => {
                // 0=ready/1=busy; bit n covers address offset n+1
                self.rbi = val;
                self.update_rbi();
            }
            OUT_UART_CMD => {} // uart mode bytes; nothing to model
            _ => {}
        }
    }
}

pub struct IoCardTermMux {
    i8080: I8080,
    mxd: Mxd,
}

impl IoCardTermMux {
    pub fn new(
        scheduler: SchedulerPtr,
        lines: CpuLinesPtr,
        baseaddr: u8,
        num_terms: usize,
    ) -> Rc<RefCell<IoCardTermMux>> {
        let num_terms = num_terms.clamp(1, MAX_TERMINALS);
        let ports: Vec<UartPortPtr> = (0..MAX_TERMINALS)
            .map(|_| Rc::new(RefCell::new(UartPort { rx_ready: false, rx_byte: 0, tx_busy: false })))
            .collect();
        let terms: Vec<TerminalPtr> = (0..num_terms)
            .map(|n| Terminal::new_smart(&scheduler, n, Rc::clone(&ports[n])))
            .collect();

        let mut i8080 = I8080::new();
        i8080.reset();

        Rc::new(RefCell::new(IoCardTermMux {
            i8080,
            mxd: Mxd {
                scheduler,
                lines,
                baseaddr,
                selected: false,
                cpb: true,
                io_offset: 0,
                prime_seen: true,
                obs_seen: false,
                cbs_seen: false,
                obscbs_offset: 0,
                obscbs_data: 0,
                rbi: 0xFF, // not ready
                uart_sel: 0,
                eprom: vec![0; EPROM_SIZE],
                ram: vec![0; RAM_SIZE],
                ports,
                terms,
            },
        }))
    }

    // the controller firmware; the original card carries it in EPROM
    pub fn load_eprom(&mut self, image: &[u8]) {
        let n = image.len().min(EPROM_SIZE);
        self.mxd.eprom[..n].copy_from_slice(&image[..n]);
    }

    pub fn terminals(&self) -> Vec<TerminalPtr> {
        self.mxd.terms.clone()
    }

    pub fn num_terminals(&self) -> usize {
        self.mxd.terms.len()
    }

    // one 8080 instruction per invocation; this is the card's clocked
    // device callback.  a pending rx byte vectors through RST 7 first.
    pub fn exec_one_op(&mut self) -> u32 {
        if self.mxd.interrupt_pending() {
            self.i8080.interrupt(0xFF, &mut self.mxd);
        }
        let ticks = self.i8080.exec_one_op(&mut self.mxd);
        if ticks > 30 {
            return 4 * NS_PER_8080_TICK;
        }
        ticks * NS_PER_8080_TICK
    }
}

impl IoCard for IoCardTermMux {
    fn get_addresses(&self) -> Vec<u8> {
        (1..8).map(|i| self.mxd.baseaddr.wrapping_add(i)).collect()
    }

    fn get_base_addresses(&self) -> Vec<u16> {
        vec![0x000, 0x040, 0x080, 0x0C0]
    }

    fn get_name(&self) -> String {
        "2236 MXD".to_string()
    }

    fn get_description(&self) -> String {
        "Terminal Mux".to_string()
    }

    fn is_configurable(&self) -> bool {
        true
    }

    // the MXD has its own power-on-reset circuit; !PRMS only sets a latch
    // the 8080 samples, cleared via OUT 0
    fn reset(&mut self, _hard: bool) {
        self.mxd.prime_seen = true;
    }

    fn select(&mut self, addr: u8) {
        self.mxd.io_offset = addr & 7;
        debug!("termmux ABS {:02x}", addr);
        if self.mxd.io_offset == 0 {
            return; // offset 0 is not handled
        }
        self.mxd.selected = true;
        self.mxd.update_rbi();
    }

    fn deselect(&mut self) {
        debug!("termmux -ABS");
        self.mxd.lines.borrow_mut().set_dev_rdy(false);
        self.mxd.selected = false;
        self.mxd.cpb = true;
    }

    fn obs(&mut self, val: u8) {
        debug!("termmux OBS: 0x{:02x}", val);
        // the hardware latches the offset on the strobe edge: the host
        // may re-address the board before the 8080 services this byte
        self.mxd.obs_seen = true;
        self.mxd.obscbs_offset = self.mxd.io_offset;
        self.mxd.obscbs_data = val;
        self.mxd.update_rbi();
    }

    fn cbs(&mut self, val: u8) {
        debug!("termmux CBS: 0x{:02x}", val);
        self.mxd.cbs_seen = true;
        self.mxd.obscbs_offset = self.mxd.io_offset;
        self.mxd.obscbs_data = val;
        self.mxd.update_rbi();
    }

    // in boot/vp mode the mux apes a dumb terminal at offset 5, driving
    // IB5 so the microcode believes the display is 80x24
    fn ib5(&self) -> bool {
        self.mxd.io_offset == 5
    }

    fn cpb(&mut self, busy: bool) {
        debug!("termmux CPB{}", if busy { '+' } else { '-' });
        self.mxd.cpb = busy;
    }
}

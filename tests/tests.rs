use em2200::bus::{self, IoBus};
use em2200::config::{CardKind, SysCfg};
use em2200::cpu_t::Cpu2200T;
use em2200::cpu_vp::Cpu2200Vp;
use em2200::devices::IoCard;
use em2200::fields::sh;
use em2200::i8080::{Bus8080, I8080};
use em2200::parser::{with_parity_t, with_parity_vp};
use em2200::processor::{decimal_add8, decimal_sub8, Cpu2200};
use em2200::scheduler::{timer_tick, Scheduler, SchedulerPtr};
use em2200::terminal::{serial_char_delay, Terminal};
use em2200::termmux::{IoCardTermMux, UartPort};
use em2200::System;
use std::cell::RefCell;
use std::rc::Rc;

fn new_scheduler() -> SchedulerPtr {
    Rc::new(RefCell::new(Scheduler::new()))
}

fn new_vp(ram_kb: usize) -> Cpu2200Vp {
    let sched = new_scheduler();
    let bus = IoBus::new(false);
    Cpu2200Vp::new(sched, bus, ram_kb)
}

// ----------------------------------------------------------------------
// scheduler
// ----------------------------------------------------------------------

#[test]
fn scheduler_advances_exactly() {
    let sched = new_scheduler();
    assert_eq!(sched.borrow().now_ns(), 0);
    timer_tick(&sched, 12345);
    assert_eq!(sched.borrow().now_ns(), 12345);
    timer_tick(&sched, 1);
    assert_eq!(sched.borrow().now_ns(), 12346);
}

#[test]
fn scheduler_fires_in_deadline_order_with_creation_tiebreak() {
    let sched = new_scheduler();
    let fired = Rc::new(RefCell::new(Vec::new()));

    for (name, delay) in [("A", 100u64), ("B", 100), ("C", 50)].iter() {
        let log = Rc::clone(&fired);
        sched.borrow_mut().create_timer(*delay, move || log.borrow_mut().push(*name)).unwrap();
    }

    timer_tick(&sched, 150);
    assert_eq!(*fired.borrow(), vec!["C", "A", "B"]);
}

#[test]
fn scheduler_reentrant_creation_waits_for_next_tick() {
    let sched = new_scheduler();
    let fired = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&fired);
    let sched2 = Rc::clone(&sched);
    sched
        .borrow_mut()
        .create_timer(100, move || {
            log.borrow_mut().push("outer");
            let log2 = Rc::clone(&log);
            sched2.borrow_mut().create_timer(0, move || log2.borrow_mut().push("inner")).unwrap();
        })
        .unwrap();

    timer_tick(&sched, 150);
    assert_eq!(*fired.borrow(), vec!["outer"]);
    timer_tick(&sched, 1);
    assert_eq!(*fired.borrow(), vec!["outer", "inner"]);
}

#[test]
fn scheduler_kill_is_idempotent() {
    let sched = new_scheduler();
    let fired = Rc::new(RefCell::new(0));

    let count = Rc::clone(&fired);
    let h = sched.borrow_mut().create_timer(100, move || *count.borrow_mut() += 1).unwrap();
    sched.borrow_mut().kill(h);
    sched.borrow_mut().kill(h);
    timer_tick(&sched, 1000);
    assert_eq!(*fired.borrow(), 0);
}

#[test]
fn scheduler_overflow_is_an_error() {
    let sched = new_scheduler();
    for _ in 0..em2200::scheduler::NUM_TIMERS {
        sched.borrow_mut().create_timer(100, || {}).unwrap();
    }
    assert!(sched.borrow_mut().create_timer(100, || {}).is_err());
}

// ----------------------------------------------------------------------
// BCD helpers
// ----------------------------------------------------------------------

fn bcd(v: u32) -> u32 {
    (v / 10) << 4 | (v % 10)
}

#[test]
fn decimal_add8_matches_decimal_arithmetic() {
    for a in 0..100 {
        for b in 0..100 {
            for ci in 0..2 {
                let r = decimal_add8(bcd(a), bcd(b), ci);
                assert_eq!(r & 0xFF, bcd((a + b + ci) % 100), "a={} b={} ci={}", a, b, ci);
                assert_eq!(r >> 8, (a + b + ci >= 100) as u32, "a={} b={} ci={}", a, b, ci);
            }
        }
    }
}

#[test]
fn decimal_sub8_matches_decimal_arithmetic() {
    for a in 0i32..100 {
        for b in 0i32..100 {
            for ci in 0i32..2 {
                let r = decimal_sub8(bcd(a as u32), bcd(b as u32), ci as u32);
                let diff = (a - b - ci).rem_euclid(100);
                assert_eq!(r & 0xFF, bcd(diff as u32), "a={} b={} ci={}", a, b, ci);
                assert_eq!(r >> 8, (a - b - ci < 0) as u32, "a={} b={} ci={}", a, b, ci);
            }
        }
    }
}

// ----------------------------------------------------------------------
// VP micromachine
// ----------------------------------------------------------------------

// DAC R0,R1 -> R2
const DAC_R0_R1_R2: u32 = (0x04 << 18) | (2 << 8) | (0 << 4) | 1;
// DSC R0,R1 -> R2
const DSC_R0_R1_R2: u32 = (0x05 << 18) | (2 << 8) | (0 << 4) | 1;

#[test]
fn vp_bcd_add_with_carry_out() {
    let mut cpu = new_vp(64);
    cpu.write_ucode(0, with_parity_vp(DAC_R0_R1_R2));

    cpu.reg[0] = 0x19;
    cpu.reg[1] = 0x28;
    cpu.sh &= !sh::CARRY;
    cpu.ic = 0;
    cpu.exec_one_op();
    assert_eq!(cpu.reg[2], 0x47);
    assert_eq!(cpu.sh & sh::CARRY, 0);

    cpu.reg[0] = 0x55;
    cpu.reg[1] = 0x55;
    cpu.sh &= !sh::CARRY;
    cpu.ic = 0;
    cpu.exec_one_op();
    assert_eq!(cpu.reg[2], 0x10);
    assert_ne!(cpu.sh & sh::CARRY, 0);
}

#[test]
fn vp_bcd_subtract_with_borrow() {
    let mut cpu = new_vp(64);
    cpu.write_ucode(0, with_parity_vp(DSC_R0_R1_R2));

    // carry=1 means no borrow pending
    cpu.reg[0] = 0x10;
    cpu.reg[1] = 0x01;
    cpu.sh |= sh::CARRY;
    cpu.ic = 0;
    cpu.exec_one_op();
    assert_eq!(cpu.reg[2], 0x09);
    assert_ne!(cpu.sh & sh::CARRY, 0); // no borrow

    cpu.reg[0] = 0x00;
    cpu.reg[1] = 0x01;
    cpu.sh |= sh::CARRY;
    cpu.ic = 0;
    cpu.exec_one_op();
    assert_eq!(cpu.reg[2], 0x99);
    assert_eq!(cpu.sh & sh::CARRY, 0); // borrow
}

#[test]
fn vp_lpi_is_transparent_to_memory_reads() {
    let mut cpu = new_vp(64);
    cpu.poke(0x1234, 0xAA);
    cpu.poke(0x1235, 0x55);

    // LPI #0x1234 with a D=1 read
    cpu.write_ucode(0, with_parity_vp(0x195234));
    cpu.ic = 0;
    cpu.exec_one_op();
    assert_eq!(cpu.pc, 0x1234);
    assert_eq!(cpu.ch, 0xAA);
    assert_eq!(cpu.cl, 0x55);
}

#[test]
fn vp_bank_mapping_pins_low_memory_to_bank_zero() {
    let mut cpu = new_vp(128);

    // ORI #0x40 -> SL selects bank 1 on a 128 KB machine
    cpu.write_ucode(0, with_parity_vp((0x08 << 18) | (4 << 14) | (12 << 8) | 0xF));
    // LPI #0x2100, D=1
    cpu.write_ucode(1, with_parity_vp(0x199100));
    // LPI #0x0100, D=1
    cpu.write_ucode(2, with_parity_vp(0x190100 | (1 << 12)));

    cpu.poke(0x0100, 0x11);
    cpu.poke(0x0101, 0x22);
    cpu.poke(0x12100, 0x77);
    cpu.poke(0x12101, 0x88);

    cpu.ic = 0;
    cpu.exec_one_op(); // set SL
    cpu.exec_one_op(); // read 0x2100 through the bank
    assert_eq!(cpu.ch, 0x77);
    assert_eq!(cpu.cl, 0x88);
    cpu.exec_one_op(); // low memory ignores the bank
    assert_eq!(cpu.ch, 0x11);
    assert_eq!(cpu.cl, 0x22);
}

#[test]
fn vp_out_of_range_memory_reads_zero() {
    let mut cpu = new_vp(32);
    // LPI #0xA000, D=1: past the end of a 32 KB machine
    cpu.write_ucode(0, with_parity_vp(0x190000 | (2 << 17) | (2 << 14) | (1 << 12)));
    cpu.ch = 0xFF;
    cpu.cl = 0xFF;
    cpu.ic = 0;
    cpu.exec_one_op();
    assert_eq!(cpu.pc, 0xA000);
    assert_eq!(cpu.ch, 0x00);
    assert_eq!(cpu.cl, 0x00);
}

#[test]
fn vp_thirty_ms_oneshot_rises_and_falls() {
    let sched = new_scheduler();
    let bus = IoBus::new(false);
    let mut cpu = Cpu2200Vp::new(Rc::clone(&sched), bus, 64);

    // CIO with bits 3:2 set retriggers the one shot
    cpu.write_ucode(0, with_parity_vp(0x17800C));
    // B 0x0001 idles at ic=1
    cpu.write_ucode(1, with_parity_vp(0x5C0000 | (1 << 8)));

    cpu.ic = 0;
    cpu.exec_one_op();
    assert_ne!(cpu.sh & sh::MS30, 0);

    // run past the 27 ms calibration point
    timer_tick(&sched, 28_000_000);
    cpu.exec_one_op();
    assert_eq!(cpu.sh & sh::MS30, 0);
}

#[test]
fn vp_illegal_op_halts_the_machine() {
    use em2200::fields::{CpuStatus, Exec};
    let mut cpu = new_vp(64);
    // a register op with bit 16 set is illegal, with good parity
    cpu.write_ucode(0, with_parity_vp(0x010201));
    cpu.ic = 0;
    match cpu.exec_one_op() {
        Exec::Illegal { ic, .. } => assert_eq!(ic, 0),
        other => panic!("expected Illegal, got {:?}", other),
    }
    assert_eq!(cpu.status(), CpuStatus::Halted);
}

#[test]
fn vp_hard_reset_is_idempotent() {
    let mut cpu = new_vp(64);
    cpu.reg[3] = 0x42;
    cpu.pc = 0x1234;
    cpu.ic = 0x77;
    cpu.sh = 0xFF;

    cpu.reset(true);
    let snap = (cpu.pc, cpu.ic, cpu.icsp, cpu.sh, cpu.sl, cpu.reg);
    cpu.reset(true);
    assert_eq!(snap, (cpu.pc, cpu.ic, cpu.icsp, cpu.sh, cpu.sl, cpu.reg));
    assert_eq!(cpu.pc, 0);
    assert_eq!(cpu.ic, 0);
    assert_eq!(cpu.reg[3], 0);
}

// ----------------------------------------------------------------------
// T micromachine
// ----------------------------------------------------------------------

#[test]
fn t_ram_nibble_packing_is_symmetric() {
    let sched = new_scheduler();
    let bus = IoBus::new(false);
    let mut cpu = Cpu2200T::new(sched, bus, 32);

    for addr in [0u16, 1, 2, 0x1234, 0x1235, 0xFFFE, 0xFFFF].iter() {
        for n in 0..=0x1F {
            cpu.ram_nib_write(*addr, n);
            assert_eq!(cpu.ram_nib_read(*addr), n & 0xF);
        }
    }

    // neighbors don't clobber each other
    cpu.ram_nib_write(0x100, 0x5);
    cpu.ram_nib_write(0x101, 0xA);
    assert_eq!(cpu.ram_nib_read(0x100), 0x5);
    assert_eq!(cpu.ram_nib_read(0x101), 0xA);
}

#[test]
fn t_binary_add_sets_nibble_carry() {
    let sched = new_scheduler();
    let bus = IoBus::new(false);
    let mut cpu = Cpu2200T::new(sched, bus, 32);

    // AC R0,R1 -> R2
    cpu.write_ucode(0, with_parity_t((6 << 14) | (2 << 8) | (0 << 4) | 1));
    cpu.reg[0] = 9;
    cpu.reg[1] = 8;
    cpu.ic = 0;
    cpu.exec_one_op();
    assert_eq!(cpu.reg[2], 0x1);
    assert_ne!(cpu.st1 & em2200::fields::st1::CARRY, 0);
}

// ----------------------------------------------------------------------
// I/O bus
// ----------------------------------------------------------------------

struct TestCard {
    baseaddr: u8,
    events: Rc<RefCell<Vec<String>>>,
}

impl IoCard for TestCard {
    fn get_addresses(&self) -> Vec<u8> {
        vec![self.baseaddr]
    }
    fn get_base_addresses(&self) -> Vec<u16> {
        vec![u16::from(self.baseaddr)]
    }
    fn get_name(&self) -> String {
        "test".to_string()
    }
    fn get_description(&self) -> String {
        "scratch card".to_string()
    }
    fn reset(&mut self, _hard: bool) {}
    fn select(&mut self, addr: u8) {
        self.events.borrow_mut().push(format!("select {:02x}", addr));
    }
    fn deselect(&mut self) {
        self.events.borrow_mut().push("deselect".to_string());
    }
    fn obs(&mut self, val: u8) {
        self.events.borrow_mut().push(format!("obs {:02x}", val));
    }
    fn cbs(&mut self, val: u8) {
        self.events.borrow_mut().push(format!("cbs {:02x}", val));
    }
    fn cpb(&mut self, busy: bool) {
        self.events.borrow_mut().push(format!("cpb {}", busy));
    }
}

#[test]
fn bus_select_deselect_ordering() {
    let bus = IoBus::new(true);
    let events = Rc::new(RefCell::new(Vec::new()));
    let card = Rc::new(RefCell::new(TestCard { baseaddr: 0x05, events: Rc::clone(&events) }));
    bus.borrow_mut().install_card(0, card);

    bus::cpu_abs(&bus, 0x05);
    assert_eq!(*events.borrow(), vec!["select 05"]);

    bus::cpu_obs(&bus, 0x41);
    bus::cpu_cbs(&bus, 0x02);
    assert_eq!(*events.borrow(), vec!["select 05", "obs 41", "cbs 02"]);

    // moving to an unoccupied address deselects first; the second strobe
    // to the same dead address stays quiet
    bus::cpu_abs(&bus, 0x06);
    assert_eq!(events.borrow().last().unwrap(), "deselect");
    let n = events.borrow().len();
    bus::cpu_abs(&bus, 0x06);
    assert_eq!(events.borrow().len(), n);

    // strobes with nothing selected go nowhere
    bus::cpu_obs(&bus, 0x99);
    assert_eq!(events.borrow().len(), n);
}

// ----------------------------------------------------------------------
// terminal byte stream
// ----------------------------------------------------------------------

fn new_smart_terminal() -> (SchedulerPtr, Rc<RefCell<UartPort>>, em2200::terminal::TerminalPtr) {
    let sched = new_scheduler();
    let port = Rc::new(RefCell::new(UartPort { rx_ready: false, rx_byte: 0, tx_busy: false }));
    let term = Terminal::new_smart(&sched, 0, Rc::clone(&port));
    (sched, port, term)
}

#[test]
fn terminal_run_decompression() {
    let (_sched, _port, term) = new_smart_terminal();
    let mut t = term.borrow_mut();

    t.process_char(0x03); // clear screen, home cursor
    for byte in [0xFB, 0x05, 0x2A].iter() {
        t.process_char(*byte);
    }

    assert_eq!(&t.disp.display[0..5], b"*****");
    assert_eq!(t.disp.display[5], b' ');
    assert_eq!(t.disp.curs_x, 5);
    assert_eq!(t.disp.curs_y, 0);
}

#[test]
fn terminal_space_runs_and_literal_escape() {
    let (_sched, _port, term) = new_smart_terminal();
    let mut t = term.borrow_mut();

    t.process_char(0x03);
    // FB 63: three spaces
    t.process_char(0xFB);
    t.process_char(0x63);
    assert_eq!(t.disp.curs_x, 3);

    // FB D0: one literal 0xFB rendered as a glyph
    t.process_char(0xFB);
    t.process_char(0xD0);
    assert_eq!(t.disp.curs_x, 4);
    assert_eq!(t.disp.display[3] & 0x7F, 0x7B);
}

#[test]
fn terminal_double_escape_is_one_literal_byte() {
    let (_sched, _port, term) = new_smart_terminal();
    let mut t = term.borrow_mut();

    // park the fifo behind a FB C1 delay so arrivals stay queued
    t.process_char(0xFB);
    t.process_char(0xC1);
    assert_eq!(t.crt_fifo_depth(), 0);

    t.process_char(0xFB);
    t.process_char(0xFB);
    assert_eq!(t.crt_fifo_depth(), 1);
}

#[test]
fn terminal_keystroke_encoding_over_the_wire() {
    let (sched, port, term) = new_smart_terminal();

    // an atom goes out as FD <atom>
    term.borrow_mut().receive_keystroke(0x85);

    let delay = serial_char_delay() as u32 + 1000;
    timer_tick(&sched, delay);
    assert!(port.borrow().rx_ready);
    assert_eq!(port.borrow().rx_byte, 0xFD);
    port.borrow_mut().rx_ready = false;

    timer_tick(&sched, delay);
    assert!(port.borrow().rx_ready);
    assert_eq!(port.borrow().rx_byte, 0x85);
}

#[test]
fn terminal_powerup_banner_and_id() {
    let (_sched, _port, term) = new_smart_terminal();
    let t = term.borrow();
    // the ID string lands on row 0 at power on (sans the asterisk)
    let row0: Vec<u8> = t.disp.display[0..7].to_vec();
    assert_eq!(&row0, b"2236DE ");
    assert_eq!(t.disp.curs_y, 1);
    assert_eq!(t.disp.curs_x, 0);
}

// ----------------------------------------------------------------------
// embedded 8080
// ----------------------------------------------------------------------

struct TestBus8080 {
    mem: Vec<u8>,
    out_log: Vec<(u8, u8)>,
}

impl Bus8080 for TestBus8080 {
    fn mem_read(&mut self, addr: u16) -> u8 {
        self.mem[addr as usize]
    }
    fn mem_write(&mut self, addr: u16, val: u8) {
        self.mem[addr as usize] = val;
    }
    fn port_in(&mut self, _port: u8) -> u8 {
        0x5A
    }
    fn port_out(&mut self, port: u8, val: u8) {
        self.out_log.push((port, val));
    }
}

#[test]
fn i8080_runs_a_small_program() {
    let mut bus = TestBus8080 { mem: vec![0; 0x10000], out_log: Vec::new() };
    // MVI A,0x12 / ADD A / OUT 7 / HLT
    let program = [0x3E, 0x12, 0x87, 0xD3, 0x07, 0x76];
    bus.mem[..program.len()].copy_from_slice(&program);

    let mut cpu = I8080::new();
    cpu.reset();
    let mut ticks = 0;
    while !cpu.halted() {
        ticks += cpu.exec_one_op(&mut bus);
    }
    assert_eq!(cpu.reg_a(), 0x24);
    assert_eq!(bus.out_log, vec![(7, 0x24)]);
    assert_eq!(ticks, 7 + 4 + 10 + 7);
}

#[test]
fn i8080_interrupt_vectors_through_rst7() {
    let mut bus = TestBus8080 { mem: vec![0; 0x10000], out_log: Vec::new() };
    // EI / NOP; the handler at 0x38 halts
    bus.mem[0] = 0xFB;
    bus.mem[1] = 0x00;
    bus.mem[0x38] = 0x76;

    let mut cpu = I8080::new();
    cpu.reset();
    cpu.exec_one_op(&mut bus); // EI
    cpu.interrupt(0xFF, &mut bus);
    assert_eq!(cpu.pc(), 0x0038);
    cpu.exec_one_op(&mut bus);
    assert!(cpu.halted());
}

// ----------------------------------------------------------------------
// MXD card
// ----------------------------------------------------------------------

#[test]
fn termmux_claims_offsets_and_drives_ib5() {
    let sched = new_scheduler();
    let lines = em2200::processor::CpuLines::new();
    let mux = IoCardTermMux::new(sched, lines, 0x00, 2);

    let addrs = mux.borrow().get_addresses();
    assert_eq!(addrs, vec![1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(mux.borrow().num_terminals(), 2);

    mux.borrow_mut().select(0x05);
    assert!(mux.borrow().ib5());
    mux.borrow_mut().select(0x06);
    assert!(!mux.borrow().ib5());

    // a zeroed eprom runs NOPs: 4 ticks at 561 ns
    assert_eq!(mux.borrow_mut().exec_one_op(), 4 * 561);
}

// ----------------------------------------------------------------------
// configuration
// ----------------------------------------------------------------------

#[test]
fn config_round_trip_compares_equal() {
    let cfg = SysCfg::defaults();
    let path = std::env::temp_dir().join("em2200_cfg_test.toml");
    cfg.save(&path).unwrap();
    let loaded = SysCfg::load(&path).unwrap();
    assert_eq!(cfg, loaded);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn config_refuses_address_conflicts() {
    let mut cfg = SysCfg::defaults();
    cfg.slots[3].card = Some(CardKind::Printer);
    cfg.slots[3].addr = 0x215; // collides with the default printer
    assert!(cfg.validate().is_err());
}

#[test]
fn config_requires_keyboard_and_crt() {
    let mut cfg = SysCfg::defaults();
    cfg.slots[0].card = None;
    assert!(cfg.validate().is_err());

    let mut cfg = SysCfg::defaults();
    cfg.slots[1].card = None;
    assert!(cfg.validate().is_err());

    // a term mux at base 0 satisfies both requirements
    let mut cfg = SysCfg::defaults();
    cfg.slots[0].card = None;
    cfg.slots[1].card = None;
    cfg.slots[4].card = Some(CardKind::TermMux);
    cfg.slots[4].addr = 0x000;
    cfg.slots[4].num_terminals = Some(1);
    cfg.cpu = em2200::CpuKind::CpuMvp;
    cfg.ram_kb = 64;
    assert!(cfg.validate().is_ok());
}

#[test]
fn config_reboot_judgement() {
    let a = SysCfg::defaults();

    let mut b = a.clone();
    b.warn_io = false;
    b.disk_realtime = false;
    b.speed_regulated = false;
    assert!(!a.needs_reboot(&b));

    let mut c = a.clone();
    c.cpu = em2200::CpuKind::CpuVp;
    c.ram_kb = 64;
    assert!(a.needs_reboot(&c));

    let mut d = a.clone();
    d.slots[1].card = Some(CardKind::Disp80x24);
    assert!(a.needs_reboot(&d));
}

// ----------------------------------------------------------------------
// whole system
// ----------------------------------------------------------------------

#[test]
fn system_builds_and_runs_a_timeslice() {
    let mut system = System::new(SysCfg::defaults()).unwrap();
    assert_eq!(system.terminals().len(), 1);
    assert!(system.default_kb_route().is_some());
    system.emulate_timeslice(30);
}

#[test]
fn system_runs_vp_microcode() {
    let mut cfg = SysCfg::defaults();
    cfg.cpu = em2200::CpuKind::CpuVp;
    cfg.ram_kb = 64;
    let mut system = System::new(cfg).unwrap();

    {
        let cpu = system.cpu();
        let mut cpu = cpu.borrow_mut();
        // spin: B 0x0000
        cpu.write_ucode(0, with_parity_vp(0x5C0000));
    }
    system.emulate_timeslice(30);

    // 30 ms of 600 ns branches went by
    assert!(system.scheduler().borrow().now_ns() >= 29_000_000);
}

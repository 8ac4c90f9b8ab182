// The I/O card contract and the simpler members of the card roster:
// keyboard controller, dumb display controllers, printer controller, the
// disk controller's bus surface, and a blank skeleton card for patterning
// new devices (and for scratch use in the test benches).
//
// Cards never hold the CPU; everything they have to say to it travels over
// the shared CpuLines cell (device-ready level, IBS data, the halt key).

use crate::processor::CpuLinesPtr;
use crate::scheduler::{arm_timer, ensure_timer_dead, timer_us, SchedulerPtr, TimerHandle};
use crate::terminal::{ScreenType, Terminal, TerminalPtr};
use log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

// keyboard key encoding flags
pub const KEYCODE_SF: u16 = 0x0100; //    special function key
pub const KEYCODE_HALT: u16 = 0x0200; //  halt/step key
pub const KEYCODE_RESET: u16 = 0x0400; // shift-reset sequence
pub const KEYCODE_EDIT: u16 = 240; //     the EDIT key

pub trait IoCard {
    // ------------------------ informative ------------------------

    // the low-byte addresses this specific card instance responds to
    fn get_addresses(&self) -> Vec<u8>;

    // the base addresses a card of this type can be strapped to;
    // the default comes first
    fn get_base_addresses(&self) -> Vec<u16>;

    // Wang model number for the card
    fn get_name(&self) -> String;

    fn get_description(&self) -> String;

    fn is_configurable(&self) -> bool {
        false
    }

    // ------------------------ operational ------------------------

    fn reset(&mut self, hard: bool);

    // the card was addressed by an -ABS strobe; addr is the latched
    // address so multi-address cards can recover their register offset
    fn select(&mut self, addr: u8);

    // another card got the -ABS; called before the new card's select
    fn deselect(&mut self);

    // a byte has been output to the device
    fn obs(&mut self, val: u8);

    // the manual says a card receiving CBS is expected to return IBS
    // later, but devices use the strobe in all sorts of ways
    fn cbs(&mut self, val: u8);

    // certain status polling reads IB5 with no strobe at all; the 80x24
    // display drives it high so microcode can learn the screen width
    fn ib5(&self) -> bool {
        false
    }

    // change of CPU-busy state; when busy drops, the CPU is waiting for
    // an IBS from the selected device
    fn cpb(&mut self, busy: bool);
}

// ------------------------------------------------------------------------
// keyboard controller (6367)
// ------------------------------------------------------------------------

pub struct IoCardKeyboard {
    lines: CpuLinesPtr,
    baseaddr: u8,
    selected: bool,
    cpb: bool,
    key_ready: bool,
    key_code: u16,
}

impl IoCardKeyboard {
    pub fn new(lines: CpuLinesPtr, baseaddr: u8) -> Rc<RefCell<IoCardKeyboard>> {
        Rc::new(RefCell::new(IoCardKeyboard {
            lines,
            baseaddr,
            selected: false,
            cpb: true,
            key_ready: false,
            key_code: 0,
        }))
    }

    // called when the host delivers a key for this keyboard
    pub fn receive_keystroke(&mut self, keycode: u16) {
        if keycode == KEYCODE_HALT {
            self.lines.borrow_mut().halt();
            return;
        }
        if keycode == KEYCODE_RESET {
            // warm start is the host's job, not a data byte
            return;
        }
        self.key_ready = true;
        self.key_code = keycode;
        self.check_keyready();
    }

    // script playback may only inject once the latch is free
    pub fn script_can_accept(&self) -> bool {
        !self.key_ready
    }

    fn check_keyready(&mut self) {
        if self.key_ready && self.selected && !self.cpb {
            let kfn = self.key_code & KEYCODE_SF != 0;
            self.lines.borrow_mut().ibs((self.key_code & 0xFF) as u8, kfn);
            self.key_ready = false;
        }
    }
}

impl IoCard for IoCardKeyboard {
    fn get_addresses(&self) -> Vec<u8> {
        vec![self.baseaddr]
    }

    fn get_base_addresses(&self) -> Vec<u16> {
        vec![0x001, 0x002, 0x003, 0x004]
    }

    fn get_name(&self) -> String {
        "6367".to_string()
    }

    fn get_description(&self) -> String {
        "Keyboard Controller".to_string()
    }

    fn reset(&mut self, _hard: bool) {
        self.selected = false;
        self.key_ready = false;
        self.cpb = true;
    }

    fn select(&mut self, _addr: u8) {
        debug!("keyboard ABS");
        self.selected = true;
        self.check_keyready();
    }

    fn deselect(&mut self) {
        debug!("keyboard -ABS");
        self.selected = false;
        self.cpb = true;
    }

    fn obs(&mut self, val: u8) {
        warn!("unexpected keyboard OBS: output of byte 0x{:02x}", val);
    }

    fn cbs(&mut self, _val: u8) {
        // the real hardware ignores this byte
    }

    fn cpb(&mut self, busy: bool) {
        // except for reset, ucode only ever clears it, and the IBS sets
        // it back
        self.cpb = busy;
        self.check_keyready();
    }
}

// ------------------------------------------------------------------------
// dumb display controller (6312A 64x16, 7011 80x24)
// ------------------------------------------------------------------------

// number of scanlines per display field
const NUM_SCANLINES: u32 = 256;

// horizontal refresh period = (1M us/s) / (60 frames/s * 256 rows/frame)
fn hsync_period() -> u64 {
    timer_us(65.0)
}

fn vsync_period() -> u64 {
    hsync_period() * u64::from(NUM_SCANLINES)
}

#[derive(Clone, Copy, PartialEq)]
enum BusyState {
    Idle,
    Char,   // wait for next hsync then clear busy
    Clear1, // wait for vsync, then advance to Clear2
    Clear2, // wait for vsync, then clear busy
}

pub struct IoCardDisplay {
    scheduler: SchedulerPtr,
    lines: CpuLinesPtr,
    terminal: TerminalPtr,
    baseaddr: u8,
    selected: bool,
    card_busy: bool,
    screen: ScreenType,
    regulated: Rc<Cell<bool>>,
    tmr_hsync: Option<TimerHandle>,
    hsync_count: u32,
    busy_state: BusyState,
    self_ref: Weak<RefCell<IoCardDisplay>>,
}

impl IoCardDisplay {
    pub fn new(
        scheduler: SchedulerPtr,
        lines: CpuLinesPtr,
        baseaddr: u8,
        screen: ScreenType,
        regulated: Rc<Cell<bool>>,
    ) -> Rc<RefCell<IoCardDisplay>> {
        let terminal = Terminal::new_dumb(&scheduler, screen);
        let card = Rc::new(RefCell::new(IoCardDisplay {
            scheduler,
            lines,
            terminal,
            baseaddr,
            selected: false,
            card_busy: false,
            screen,
            regulated,
            tmr_hsync: None,
            hsync_count: 0,
            busy_state: BusyState::Idle,
            self_ref: Weak::new(),
        }));
        card.borrow_mut().self_ref = Rc::downgrade(&card);
        card.borrow_mut().restart_hsync();
        card
    }

    pub fn terminal(&self) -> TerminalPtr {
        Rc::clone(&self.terminal)
    }

    fn restart_hsync(&mut self) {
        ensure_timer_dead(&self.scheduler, &mut self.tmr_hsync);
        self.hsync_count = 0;
        self.tcb_hsync();
    }

    // the hsync timer always runs; when realtime emulation is off it is
    // retriggered only once per field to cut the overhead 256x
    fn tcb_hsync(&mut self) {
        self.hsync_count += 1;

        let new_period = if self.regulated.get() && self.hsync_count < NUM_SCANLINES {
            hsync_period()
        } else {
            self.hsync_count = 1;
            vsync_period()
        };

        let me = self.self_ref.clone();
        self.tmr_hsync = arm_timer(&self.scheduler, new_period, move || {
            if let Some(card) = me.upgrade() {
                card.borrow_mut().tcb_hsync();
            }
        });

        match self.busy_state {
            BusyState::Idle => {}
            BusyState::Char => {
                self.card_busy = false;
                self.busy_state = BusyState::Idle;
                if self.selected {
                    self.lines.borrow_mut().set_dev_rdy(true);
                }
            }
            BusyState::Clear1 => {
                if self.hsync_count == 1 {
                    self.busy_state = BusyState::Clear2;
                }
            }
            BusyState::Clear2 => {
                if self.hsync_count == 1 {
                    self.card_busy = false;
                    self.busy_state = BusyState::Idle;
                    if self.selected {
                        self.lines.borrow_mut().set_dev_rdy(true);
                    }
                }
            }
        }
    }
}

impl IoCard for IoCardDisplay {
    fn get_addresses(&self) -> Vec<u8> {
        vec![self.baseaddr]
    }

    fn get_base_addresses(&self) -> Vec<u16> {
        vec![0x005, 0x006, 0x007]
    }

    fn get_name(&self) -> String {
        match self.screen {
            ScreenType::Crt64x16 => "6312A".to_string(),
            _ => "7011".to_string(),
        }
    }

    fn get_description(&self) -> String {
        match self.screen {
            ScreenType::Crt64x16 => "64x16 CRT Controller".to_string(),
            _ => "80x24 CRT Controller".to_string(),
        }
    }

    fn reset(&mut self, hard: bool) {
        self.busy_state = BusyState::Idle;
        self.selected = false;
        self.card_busy = false;
        self.terminal.borrow_mut().reset(hard);
        self.restart_hsync();
    }

    fn select(&mut self, _addr: u8) {
        debug!("display ABS");
        self.selected = true;
        self.lines.borrow_mut().set_dev_rdy(!self.card_busy);
    }

    fn deselect(&mut self) {
        debug!("display -ABS");
        self.lines.borrow_mut().set_dev_rdy(false);
        self.selected = false;
    }

    fn obs(&mut self, val: u8) {
        self.terminal.borrow_mut().process_char(val);

        // when speed regulation is on, model the controller's busy timing
        if self.regulated.get() {
            if val == 0x03 {
                self.busy_state = BusyState::Clear1;
                self.card_busy = true;
            } else if val >= 0x10 {
                self.busy_state = BusyState::Char;
                self.card_busy = true;
            }
        }

        self.lines.borrow_mut().set_dev_rdy(!self.card_busy);
    }

    fn cbs(&mut self, _val: u8) {
        // the real hardware ignores this byte
    }

    fn ib5(&self) -> bool {
        self.screen != ScreenType::Crt64x16
    }

    fn cpb(&mut self, _busy: bool) {
        // the display is write-only; just keep ready up to date
        self.lines.borrow_mut().set_dev_rdy(!self.card_busy);
    }
}

// ------------------------------------------------------------------------
// printer controller (7079)
// ------------------------------------------------------------------------

pub struct IoCardPrinter {
    lines: CpuLinesPtr,
    baseaddr: u8,
    selected: bool,
    cpb: bool,
    sink: Option<Box<dyn FnMut(u8)>>,
}

impl IoCardPrinter {
    pub fn new(lines: CpuLinesPtr, baseaddr: u8) -> Rc<RefCell<IoCardPrinter>> {
        Rc::new(RefCell::new(IoCardPrinter {
            lines,
            baseaddr,
            selected: false,
            cpb: true,
            sink: None,
        }))
    }

    // the host hooks the byte stream here; without a sink, output drops
    pub fn set_sink(&mut self, sink: Box<dyn FnMut(u8)>) {
        self.sink = Some(sink);
    }
}

impl IoCard for IoCardPrinter {
    fn get_addresses(&self) -> Vec<u8> {
        vec![self.baseaddr]
    }

    fn get_base_addresses(&self) -> Vec<u16> {
        vec![0x215, 0x216]
    }

    fn get_name(&self) -> String {
        "7079".to_string()
    }

    fn get_description(&self) -> String {
        "Printer Controller".to_string()
    }

    fn reset(&mut self, _hard: bool) {
        self.selected = false;
        self.cpb = true;
    }

    fn select(&mut self, _addr: u8) {
        debug!("printer ABS");
        self.selected = true;
        self.lines.borrow_mut().set_dev_rdy(true);
    }

    fn deselect(&mut self) {
        debug!("printer -ABS");
        self.lines.borrow_mut().set_dev_rdy(false);
        self.selected = false;
        self.cpb = true;
    }

    fn obs(&mut self, val: u8) {
        if let Some(sink) = self.sink.as_mut() {
            sink(val);
        }
        self.lines.borrow_mut().set_dev_rdy(true);
    }

    fn cbs(&mut self, val: u8) {
        self.obs(val);
    }

    fn cpb(&mut self, busy: bool) {
        self.cpb = busy;
        self.lines.borrow_mut().set_dev_rdy(true);
    }
}

// ------------------------------------------------------------------------
// disk controller (6541) -- bus surface only
// ------------------------------------------------------------------------
// The on-disk format and all file handling belong to the host; the card
// owns the slot, the addresses, and the drive roster, and delegates the
// media content to whatever the host mounted.

pub trait DiskMedia {
    fn filename(&self) -> String;
    fn flush(&mut self) {}
    fn format(&mut self) {}
}

pub const WVD_STAT_DRIVE_EXISTENT: u8 = 0x01;
pub const WVD_STAT_DRIVE_OCCUPIED: u8 = 0x02;

pub struct IoCardDisk {
    lines: CpuLinesPtr,
    baseaddr: u8,
    selected: bool,
    cpb: bool,
    drives: Vec<Option<Box<dyn DiskMedia>>>,
}

impl IoCardDisk {
    pub fn new(lines: CpuLinesPtr, baseaddr: u8) -> Rc<RefCell<IoCardDisk>> {
        Rc::new(RefCell::new(IoCardDisk {
            lines,
            baseaddr,
            selected: false,
            cpb: true,
            drives: vec![None, None],
        }))
    }

    pub fn wvd_insert_disk(&mut self, drive: usize, media: Box<dyn DiskMedia>) {
        self.drives[drive] = Some(media);
    }

    pub fn wvd_remove_disk(&mut self, drive: usize) -> Option<Box<dyn DiskMedia>> {
        self.drives[drive].take()
    }

    pub fn wvd_flush(&mut self, drive: usize) {
        if let Some(media) = self.drives[drive].as_mut() {
            media.flush();
        }
    }

    pub fn wvd_format_file(&mut self, drive: usize) {
        if let Some(media) = self.drives[drive].as_mut() {
            media.format();
        }
    }

    pub fn wvd_drive_status(&self, drive: usize) -> u8 {
        if drive >= self.drives.len() {
            return 0;
        }
        WVD_STAT_DRIVE_EXISTENT
            | if self.drives[drive].is_some() { WVD_STAT_DRIVE_OCCUPIED } else { 0 }
    }

    pub fn wvd_get_filename(&self, drive: usize) -> Option<String> {
        self.drives[drive].as_ref().map(|m| m.filename())
    }
}

impl IoCard for IoCardDisk {
    fn get_addresses(&self) -> Vec<u8> {
        vec![self.baseaddr]
    }

    fn get_base_addresses(&self) -> Vec<u16> {
        vec![0x310, 0x320, 0x330]
    }

    fn get_name(&self) -> String {
        "6541".to_string()
    }

    fn get_description(&self) -> String {
        "Disk Controller".to_string()
    }

    fn is_configurable(&self) -> bool {
        true
    }

    fn reset(&mut self, _hard: bool) {
        self.selected = false;
        self.cpb = true;
    }

    fn select(&mut self, _addr: u8) {
        debug!("disk ABS");
        self.selected = true;
        self.lines.borrow_mut().set_dev_rdy(true);
    }

    fn deselect(&mut self) {
        self.lines.borrow_mut().set_dev_rdy(false);
        self.selected = false;
        self.cpb = true;
    }

    fn obs(&mut self, val: u8) {
        debug!("disk OBS: 0x{:02x}", val);
        self.lines.borrow_mut().set_dev_rdy(true);
    }

    fn cbs(&mut self, val: u8) {
        debug!("disk CBS: 0x{:02x}", val);
        self.lines.borrow_mut().set_dev_rdy(true);
    }

    fn cpb(&mut self, busy: bool) {
        self.cpb = busy;
    }
}

// ------------------------------------------------------------------------
// blank card -- a skeleton for patterning future I/O devices
// ------------------------------------------------------------------------

pub struct IoCardBlank {
    lines: CpuLinesPtr,
    baseaddr: u8,
    selected: bool,
    cpb: bool,
}

impl IoCardBlank {
    pub fn new(lines: CpuLinesPtr, baseaddr: u8) -> Rc<RefCell<IoCardBlank>> {
        Rc::new(RefCell::new(IoCardBlank { lines, baseaddr, selected: false, cpb: true }))
    }
}

impl IoCard for IoCardBlank {
    fn get_addresses(&self) -> Vec<u8> {
        vec![self.baseaddr]
    }

    fn get_base_addresses(&self) -> Vec<u16> {
        vec![0x710, 0x720, 0x730]
    }

    fn get_name(&self) -> String {
        "Xxx".to_string()
    }

    fn get_description(&self) -> String {
        "Blank Card".to_string()
    }

    fn reset(&mut self, _hard: bool) {
        self.selected = false;
        self.cpb = true;
    }

    fn select(&mut self, _addr: u8) {
        self.selected = true;
        self.lines.borrow_mut().set_dev_rdy(true);
    }

    fn deselect(&mut self) {
        self.lines.borrow_mut().set_dev_rdy(false);
        self.selected = false;
        self.cpb = true;
    }

    fn obs(&mut self, _val: u8) {}

    fn cbs(&mut self, _val: u8) {}

    fn cpb(&mut self, busy: bool) {
        self.cpb = busy;
    }
}

// The terminal model.  It is either a dumb display controller or a 2336DE
// smart terminal:
//
// Dumb controller:
//    poking character bytes into the display plane
//    moving the cursor
//    clearing the screen
// Smart terminal:
//    same as the dumb controller, plus
//    maintaining character attributes
//    box drawing
//    command stream parsing and run decompression
//    remapping the keyboard encoding to the 2336 serial protocol
//    modeling uart delay and rate limiting
//
// TODO: the terminal never generates printer flow control (F9) back
// toward the host; the prt byte stream itself goes to the host sink.

use crate::devices::{KEYCODE_EDIT, KEYCODE_HALT, KEYCODE_RESET, KEYCODE_SF};
use crate::scheduler::{arm_timer, ensure_timer_dead, timer_ms, timer_us, SchedulerPtr, TimerHandle};
use crate::termmux::UartPortPtr;
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

static ID_STRING: &str = "*2236DE R2016 19200BPS 8+O (USA)";

const KB_BUFF_MAX: usize = 64;
const CRT_BUFF_MAX: usize = 128;

// character attribute plane bits
pub const CHAR_ATTR_BRIGHT: u8 = 0x01;
pub const CHAR_ATTR_BLINK: u8 = 0x02;
pub const CHAR_ATTR_INV: u8 = 0x04;
pub const CHAR_ATTR_ALT: u8 = 0x08;
pub const CHAR_ATTR_LEFT: u8 = 0x10; //  box: left vertical stroke
pub const CHAR_ATTR_RIGHT: u8 = 0x20; // box: right vertical stroke
pub const CHAR_ATTR_VERT: u8 = 0x40; //  box: horizontal stroke under cell

// character transmission time: 11 bits at 19200 baud
pub fn serial_char_delay() -> u64 {
    timer_us(11.0 * 1.0e6 / 19200.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenType {
    Crt64x16,
    Crt80x24,
    Term2236DE,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    Off,
    On,
    Blink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowState {
    Start,
    GoPend,
    Going,
    StopPend,
    Stopped,
}

// everything the host needs to paint the screen
pub struct DisplayState {
    pub screen: ScreenType,
    pub chars_w: i32,
    pub chars_h: i32,
    pub chars_h2: i32, // the 2236 keeps a 25th status row
    pub curs_x: i32,
    pub curs_y: i32,
    pub curs_attr: CursorMode,
    pub display: Vec<u8>,
    pub attr: Vec<u8>,
    pub dirty: bool,
}

pub type TerminalPtr = Rc<RefCell<Terminal>>;

pub struct Terminal {
    scheduler: SchedulerPtr,
    self_ref: Weak<RefCell<Terminal>>,
    term_num: usize,

    pub disp: DisplayState,

    // command stream immediate routing
    escape_seen: bool,
    crt_sink: bool,

    // FB escape accumulation
    raw_buf: [u8; 3],
    raw_cnt: usize,

    // 02 command accumulation
    input_buf: [u8; 8],
    input_cnt: usize,

    attrs: u8,
    attr_on: bool,
    attr_temp: bool,
    attr_under: bool,
    box_bottom: bool,

    // crt byte fifo and flow control
    crt_buff: VecDeque<u8>,
    crt_flow_state: FlowState,
    selectp_tmr: Option<TimerHandle>,

    prt_flow_state: FlowState,

    // keystroke transmit side
    kb_buff: VecDeque<u8>,
    kb_recent: VecDeque<u8>,
    tx_tmr: Option<TimerHandle>,
    init_tmr: Option<TimerHandle>,
    script_active: bool,
    active_scripts: usize,
    uart: Option<UartPortPtr>,

    prt_sink: Option<Box<dyn FnMut(u8)>>,
    dings: u32,
}

impl Terminal {
    fn new(scheduler: SchedulerPtr, screen: ScreenType, term_num: usize) -> Terminal {
        let (w, h) = match screen {
            ScreenType::Crt64x16 => (64, 16),
            _ => (80, 24),
        };
        let h2 = if screen == ScreenType::Term2236DE { 25 } else { h };
        Terminal {
            scheduler,
            self_ref: Weak::new(),
            term_num,
            disp: DisplayState {
                screen,
                chars_w: w,
                chars_h: h,
                chars_h2: h2,
                curs_x: 0,
                curs_y: 0,
                curs_attr: CursorMode::On,
                display: vec![0x20; (w * h2) as usize],
                attr: vec![0x00; (w * h2) as usize],
                dirty: true,
            },
            escape_seen: false,
            crt_sink: true,
            raw_buf: [0; 3],
            raw_cnt: 0,
            input_buf: [0; 8],
            input_cnt: 0,
            attrs: CHAR_ATTR_BRIGHT,
            attr_on: false,
            attr_temp: false,
            attr_under: false,
            box_bottom: false,
            crt_buff: VecDeque::new(),
            crt_flow_state: FlowState::Start,
            selectp_tmr: None,
            prt_flow_state: FlowState::Start,
            kb_buff: VecDeque::new(),
            kb_recent: VecDeque::new(),
            tx_tmr: None,
            init_tmr: None,
            script_active: false,
            active_scripts: 0,
            uart: None,
            prt_sink: None,
            dings: 0,
        }
    }

    // a dumb CRT behind a display controller card
    pub fn new_dumb(scheduler: &SchedulerPtr, screen: ScreenType) -> TerminalPtr {
        let term = Rc::new(RefCell::new(Terminal::new(Rc::clone(scheduler), screen, 0)));
        term.borrow_mut().self_ref = Rc::downgrade(&term);
        term.borrow_mut().reset(true);
        term
    }

    // a smart terminal hanging off an MXD serial port.  a real 2336 sends
    // F8 about a second after power up (the second is for self tests).
    pub fn new_smart(scheduler: &SchedulerPtr, term_num: usize, uart: UartPortPtr) -> TerminalPtr {
        let term =
            Rc::new(RefCell::new(Terminal::new(Rc::clone(scheduler), ScreenType::Term2236DE, term_num)));
        term.borrow_mut().self_ref = Rc::downgrade(&term);
        term.borrow_mut().uart = Some(uart);
        term.borrow_mut().reset(true);
        let sched = Rc::clone(&term.borrow().scheduler);
        let me = Rc::downgrade(&term);
        let tmr = arm_timer(&sched, timer_ms(700.0), move || {
            if let Some(t) = me.upgrade() {
                t.borrow_mut().send_init_seq();
            }
        });
        term.borrow_mut().init_tmr = tmr;
        term
    }

    pub fn term_num(&self) -> usize {
        self.term_num
    }

    // host-side polling of the bell and the redraw flag
    pub fn take_dings(&mut self) -> u32 {
        std::mem::replace(&mut self.dings, 0)
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.disp.dirty, false)
    }

    pub fn set_script_active(&mut self, active: bool, concurrent: usize) {
        self.script_active = active;
        self.active_scripts = concurrent;
    }

    pub fn script_can_accept(&self) -> bool {
        self.kb_buff.len() < 5
    }

    // how much inbound traffic is queued for the CRT; hosts can surface
    // this next to the flow-control state
    pub fn crt_fifo_depth(&self) -> usize {
        self.crt_buff.len()
    }

    // the host hooks the remote printer byte stream here; without a sink,
    // output drops
    pub fn set_prt_sink(&mut self, sink: Box<dyn FnMut(u8)>) {
        self.prt_sink = Some(sink);
    }

    // ----------------------------------------------------------------
    // reset
    // ----------------------------------------------------------------

    // hard_reset=true is power on; false is the SHIFT-RESET sequence or a
    // programmatic reset command
    pub fn reset(&mut self, hard_reset: bool) {
        let smart = self.disp.screen == ScreenType::Term2236DE;

        // dumb controllers don't independently reset; the host CPU tells
        // them to clear
        if hard_reset || smart {
            self.escape_seen = false;
            self.crt_sink = true;
            self.reset_crt();
            self.reset_prt();
        }

        // smart terminals echo the ID string at power on
        if smart && hard_reset {
            let id: Vec<u8> = ID_STRING.bytes().skip(1).collect();
            for byte in id {
                self.process_crt_char3(byte);
            }
            self.process_crt_char3(0x0D);
            self.process_crt_char3(0x0A);
        }
    }

    fn reset_crt(&mut self) {
        self.disp.curs_x = 0;
        self.disp.curs_y = 0;
        self.disp.curs_attr = CursorMode::On;
        self.disp.dirty = true;
        self.clear_screen();

        self.raw_cnt = 0;
        self.input_cnt = 0;

        // if a script issues CLEAR the terminal receives a reset-crt
        // sequence; wiping the tx state then would break the playback
        if !self.script_active {
            ensure_timer_dead(&self.scheduler, &mut self.tx_tmr);
            self.kb_buff.clear();
            self.kb_recent.clear();
        }

        self.attrs = CHAR_ATTR_BRIGHT; // implicitly the primary char set
        self.attr_on = false;
        self.attr_temp = false;
        self.attr_under = false;
        self.box_bottom = false;

        self.crt_buff.clear();
        self.crt_flow_state = FlowState::Start;
        ensure_timer_dead(&self.scheduler, &mut self.selectp_tmr);
    }

    fn reset_prt(&mut self) {
        self.prt_flow_state = FlowState::Start;
    }

    // ----------------------------------------------------------------
    // terminal to mxd channel
    // ----------------------------------------------------------------

    // the 2336 sends E4 F8 at power up; E4 shows up as a spurious INIT
    // keyword so only the F8 crt-go byte is sent
    fn send_init_seq(&mut self) {
        self.init_tmr = None;
        self.kb_buff.push_back(0xF8);
        self.check_kb_buffer();
    }

    // the incoming keyval uses the first-generation keyboard encoding;
    // the smart terminal couldn't send a 9th bit per key and codes some
    // keys differently, including as two-byte sequences
    pub fn receive_keystroke(&mut self, keycode: u16) {
        if self.kb_buff.len() >= KB_BUFF_MAX {
            warn!("the terminal keyboard buffer dropped a character");
            return;
        }

        if keycode == KEYCODE_RESET {
            self.reset(false); // clear screen, home cursor, empty fifos
            self.kb_buff.push_back(0x12);
        } else if keycode == KEYCODE_HALT {
            self.kb_buff.push_back(0x13);
        } else if keycode == (KEYCODE_SF | KEYCODE_EDIT) {
            self.kb_buff.push_back(0xBD);
        } else if keycode & KEYCODE_SF != 0 {
            self.kb_buff.push_back(0xFD);
            self.kb_buff.push_back((keycode & 0xFF) as u8);
        } else if keycode == 0xE6 {
            // the pc TAB key is "STMT" on a 2200T keyboard but "FN" in
            // 2336 mode
            self.kb_buff.push_back(0xFD);
            self.kb_buff.push_back(0x7E);
        } else if keycode == 0xE5 {
            // erase
            self.kb_buff.push_back(0xE5);
        } else if (0x80..0xE5).contains(&keycode) {
            // an atom; add the prefix
            self.kb_buff.push_back(0xFD);
            self.kb_buff.push_back((keycode & 0xFF) as u8);
        } else {
            self.kb_buff.push_back((keycode & 0xFF) as u8);
        }

        self.check_kb_buffer();
    }

    // send the next keystroke byte down the serial line and model the
    // transport delay with a timer
    fn check_kb_buffer(&mut self) {
        if self.tx_tmr.is_some() {
            return; // serial channel is in use
        }

        if self.kb_buff.is_empty()
            && self.crt_flow_state != FlowState::StopPend
            && self.crt_flow_state != FlowState::GoPend
        {
            return;
        }

        // a pending flow control byte cuts to the head of the line
        let byte = if self.crt_flow_state == FlowState::GoPend {
            self.crt_flow_state = FlowState::Going;
            0xF8
        } else if self.crt_flow_state == FlowState::StopPend {
            self.crt_flow_state = FlowState::Stopped;
            0xFA
        } else {
            self.kb_buff.pop_front().unwrap_or(0x00)
        };

        // the 2200 has no flow control against a terminal overrunning the
        // host, and the MXD can't take the full line rate.  scripts run at
        // 1/4 rate for normal characters and 1/100 for carriage returns.
        let mut delay = serial_char_delay();
        if self.script_active {
            delay *= if byte == 0x0D { 100 } else { 4 };
        }
        // several terminals playing scripts at once slow the MXD further
        if self.active_scripts > 1 {
            delay *= self.active_scripts as u64;
        }

        // the CLEAR command takes the host a long time to chew on; an
        // extra delay is inserted once the character after its CR is seen
        self.kb_recent.push_back(byte);
        if self.kb_recent.len() > 7 {
            self.kb_recent.pop_front();
            if self.script_active {
                let k: Vec<u8> = self.kb_recent.iter().copied().collect();
                if k[0] == b'C'
                    && k[1] == b'L'
                    && k[2] == b'E'
                    && k[3] == b'A'
                    && k[4] == b'R'
                    && k[5] == 0x0D
                {
                    delay = timer_ms(1000.0);
                }
            }
        }

        let me = self.self_ref.clone();
        self.tx_tmr = arm_timer(&self.scheduler, delay, move || {
            if let Some(t) = me.upgrade() {
                t.borrow_mut().term_to_mxd(byte);
            }
        });
    }

    // the character finished serializing; it lands in the uart rx latch
    fn term_to_mxd(&mut self, byte: u8) {
        self.tx_tmr = None;
        if let Some(uart) = &self.uart {
            let mut port = uart.borrow_mut();
            if port.rx_ready {
                warn!("terminal received char too fast");
            }
            port.rx_ready = true;
            port.rx_byte = byte;
        }
        self.check_kb_buffer();
    }

    // ----------------------------------------------------------------
    // cursor and screen plumbing
    // ----------------------------------------------------------------

    fn adjust_cursor_y(&mut self, delta: i32) {
        self.disp.curs_y += delta;
        if self.disp.curs_y >= self.disp.chars_h {
            self.disp.curs_y = self.disp.chars_h - 1;
            if self.disp.screen != ScreenType::Term2236DE {
                self.disp.curs_x = 0; // yes, scrolling has this effect
            }
            self.scroll_screen();
        } else if self.disp.curs_y < 0 {
            self.disp.curs_y = self.disp.chars_h - 1; // wrap around
        }
    }

    fn adjust_cursor_x(&mut self, delta: i32) {
        self.disp.curs_x += delta;
        if self.disp.curs_x >= self.disp.chars_w {
            self.disp.curs_x = 0;
        } else if self.disp.curs_x < 0 {
            self.disp.curs_x = self.disp.chars_w - 1;
        }
    }

    fn clear_screen(&mut self) {
        for byte in self.disp.display.iter_mut() {
            *byte = 0x20;
        }
        for byte in self.disp.attr.iter_mut() {
            *byte = 0x00;
        }
        self.disp.curs_x = 0;
        self.disp.curs_y = 0;
    }

    // scroll the whole plane up one row and blank the exposed row
    fn scroll_screen(&mut self) {
        let w = self.disp.chars_w as usize;
        let rows = self.disp.chars_h2 as usize;
        self.disp.display.copy_within(w..w * rows, 0);
        for byte in &mut self.disp.display[w * (rows - 1)..] {
            *byte = b' ';
        }
        if self.disp.screen == ScreenType::Term2236DE {
            self.disp.attr.copy_within(w..w * rows, 0);
            for byte in &mut self.disp.attr[w * (rows - 1)..] {
                *byte = 0x00;
            }
        }
    }

    fn screen_write_char(&mut self, x: i32, y: i32, byte: u8) {
        let idx = (self.disp.chars_w * y + x) as usize;
        self.disp.display[idx] = byte;
    }

    fn screen_write_attr(&mut self, x: i32, y: i32, attr: u8) {
        let idx = (self.disp.chars_w * y + x) as usize;
        self.disp.attr[idx] = attr;
    }

    // set or clear one box-drawing bit at the cursor, possibly one row
    // below it
    fn set_box_attr(&mut self, draw: bool, bit: u8, yoff: i32) {
        let y = self.disp.curs_y + yoff;
        if y < 0 || y >= self.disp.chars_h2 {
            return;
        }
        let idx = (self.disp.chars_w * y + self.disp.curs_x) as usize;
        if draw {
            self.disp.attr[idx] |= bit;
        } else {
            self.disp.attr[idx] &= !bit;
        }
    }

    // ----------------------------------------------------------------
    // host to terminal byte stream routing
    // ----------------------------------------------------------------
    // For dumb terminals the byte goes straight to the lowest level
    // character handling.  The 2236DE has a multi-level interpreter; at
    // this level a few immediate escape sequences act without queueing
    // and everything else is routed to the crt or prt FIFO.

    pub fn process_char(&mut self, byte: u8) {
        if self.disp.screen != ScreenType::Term2236DE {
            // dumb display: no fifo, no command parsing, no delay
            self.process_crt_char3(byte);
            return;
        }

        debug!("terminal {} rx 0x{:02x}, raw_cnt={}", self.term_num, byte, self.raw_cnt);

        // FB escapes stack: an immediate sequence can arrive in the middle
        // of, say, the compression sequence FB <FB F0> 68
        if byte == 0xFB {
            if self.escape_seen {
                // two escapes in a row: forward one literal FB
                self.sink_byte(0xFB);
            }
            self.escape_seen = true;
            return;
        }

        if !self.escape_seen {
            self.sink_byte(byte);
            return;
        }

        // <FB> <something>: FB F0/F1/F2/F6 act immediately, everything
        // else passes through with its escape
        self.escape_seen = false;
        match byte {
            0xF0 => self.crt_sink = true,  // route to crt
            0xF1 => self.crt_sink = false, // route to prt
            0xF2 => {
                // restart terminal; a real 2336 answers with crt-go
                self.reset(false);
                self.receive_keystroke(0xF8);
            }
            0xF6 => {
                // reset crt only; a real 2336 sends prt-stop then two
                // crt-go bytes
                self.reset_crt();
                self.receive_keystroke(0xF9);
                self.receive_keystroke(0xF8);
                self.receive_keystroke(0xF8);
            }
            _ => {
                self.sink_byte(0xFB);
                self.sink_byte(byte);
            }
        }
    }

    fn sink_byte(&mut self, byte: u8) {
        if self.crt_sink {
            self.crt_char_fifo(byte);
        } else {
            self.prt_char_fifo(byte);
        }
    }

    // ----------------------------------------------------------------
    // crt byte stream parsing
    // ----------------------------------------------------------------

    fn crt_char_fifo(&mut self, byte: u8) {
        if self.crt_buff.len() == CRT_BUFF_MAX {
            warn!("terminal {} had a crt fifo overflow", self.term_num + 1);
            return; // the new byte is dropped
        }

        self.crt_buff.push_back(byte);
        let size = self.crt_buff.len();
        if size == 96 || size == 113 {
            self.crt_flow_state = FlowState::StopPend;
            self.check_kb_buffer();
        }

        self.check_crt_fifo();
    }

    // drain the crt fifo until it is empty or a delay is pending
    fn check_crt_fifo(&mut self) {
        while !self.crt_buff.is_empty() {
            if self.selectp_tmr.is_some() {
                return; // waiting on a SELECT Pn timeout
            }
            let byte = self.crt_buff.pop_front().unwrap_or(0);
            if self.crt_buff.len() == 30 && self.crt_flow_state == FlowState::Stopped {
                // back below the threshold: let the host go again
                self.crt_flow_state = FlowState::GoPend;
                self.check_kb_buffer();
            }
            self.process_crt_char1(byte);
        }
    }

    // decode FB escape sequences and decompress runs
    fn process_crt_char1(&mut self, byte: u8) {
        if self.raw_cnt == 0 && byte == 0xFB {
            self.raw_buf[0] = 0xFB;
            self.raw_cnt = 1;
            return;
        }

        if self.raw_cnt == 0 {
            self.process_crt_char2(byte);
            return;
        }

        self.raw_buf[self.raw_cnt] = byte;
        self.raw_cnt += 1;

        // a character run: FB nn cc expands to nn copies of cc
        if self.raw_cnt == 3 {
            debug!("decompress run: cnt={}, chr=0x{:02x}", self.raw_buf[1], self.raw_buf[2]);
            let (n, c) = (self.raw_buf[1], self.raw_buf[2]);
            for _ in 0..n {
                self.process_crt_char2(c);
            }
            self.raw_cnt = 0;
            return;
        }

        // FB nn with count < 0x60 is a three byte sequence; in practice
        // a count of 1 occurs (e.g. SF12)
        if self.raw_buf[1] < 0x60 {
            return;
        }

        // FB nn with 0x60 <= nn <= 0xBF is (nn - 0x60) spaces
        if (0x60..=0xBF).contains(&self.raw_buf[1]) {
            debug!("decompress spaces: cnt={}", self.raw_buf[1] - 0x60);
            for _ in 0x60..self.raw_buf[1] {
                self.process_crt_char2(0x20);
            }
            self.raw_cnt = 0;
            return;
        }

        // delay sequence FB Cn: n/6 seconds
        if (0xC1..=0xC9).contains(&self.raw_buf[1]) {
            let delay_ms = 1000 * i64::from(self.raw_buf[1] - 0xC0) / 6;
            if delay_ms > 0 {
                let me = self.self_ref.clone();
                self.selectp_tmr =
                    arm_timer(&self.scheduler, timer_ms(delay_ms as f64), move || {
                        if let Some(t) = me.upgrade() {
                            let mut t = t.borrow_mut();
                            t.selectp_tmr = None;
                            t.check_crt_fifo();
                        }
                    });
            }
            self.raw_cnt = 0;
            return;
        }

        // literal escape byte: FB D0
        if self.raw_buf[1] == 0xD0 {
            self.process_crt_char2(0xFB);
            self.raw_cnt = 0;
            return;
        }

        // disable cursor blink (FB F8); does not re-enable the cursor
        if self.raw_buf[1] == 0xF8 {
            if self.disp.curs_attr == CursorMode::Blink {
                self.disp.curs_attr = CursorMode::On;
            }
            self.raw_cnt = 0;
            return;
        }

        // enable cursor blink (FB FC; FB F4 is a documented synonym);
        // a cursor that was off stays off
        if self.raw_buf[1] == 0xF4 || self.raw_buf[1] == 0xFC {
            if self.disp.curs_attr == CursorMode::On {
                self.disp.curs_attr = CursorMode::Blink;
            }
            self.raw_cnt = 0;
            return;
        }

        // unknown sequences pass through
        debug!("unexpected sequence: 0x{:02x} 0x{:02x}", self.raw_buf[0], self.raw_buf[1]);
        let (b0, b1) = (self.raw_buf[0], self.raw_buf[1]);
        self.process_crt_char2(b0);
        self.process_crt_char2(b1);
        self.raw_cnt = 0;
    }

    // second level: the 02 xx command machine
    fn process_crt_char2(&mut self, byte: u8) {
        if self.input_cnt == 0 {
            match byte {
                0x02 => {
                    // character attribute, char set, box draw, ...
                    self.input_buf[0] = byte;
                    self.input_cnt = 1;
                }
                0x0D => {
                    // carriage return drops the temporary attribute mode
                    self.attr_temp = false;
                    self.process_crt_char3(0x0D);
                }
                0x0E => {
                    // enable attributes (temporarily after an 04 define)
                    self.attr_on = false;
                    self.attr_temp = true;
                }
                0x0F => {
                    self.attr_on = false;
                    self.attr_temp = false;
                }
                _ => self.process_crt_char3(byte),
            }
            return;
        }

        self.input_buf[self.input_cnt] = byte;
        self.input_cnt += 1;

        // cursor blink enable: 02 05 0F
        if self.input_cnt == 3 && self.input_buf[1] == 0x05 {
            if self.input_buf[2] == 0x0F {
                self.disp.curs_attr = CursorMode::Blink;
            }
            self.input_cnt = 0;
            return;
        }

        // character set select: 02 02 {00|02} 0F
        if self.input_cnt == 4 && self.input_buf[1] == 0x02 {
            if self.input_buf[3] == 0x0F {
                match self.input_buf[2] {
                    0x00 => self.attrs &= !CHAR_ATTR_ALT,
                    0x02 => self.attrs |= CHAR_ATTR_ALT,
                    _ => {}
                }
            }
            self.input_cnt = 0;
            return;
        }

        // define attributes, possibly enabling them: 02 04 xx yy {0E|0F}
        if self.input_cnt == 3 && self.input_buf[1] == 0x04 {
            if !matches!(self.input_buf[2], 0x00 | 0x02 | 0x04 | 0x0B) {
                self.input_cnt = 0;
            }
            return;
        }
        if self.input_cnt == 4 && self.input_buf[1] == 0x04 {
            if !matches!(self.input_buf[3], 0x00 | 0x02 | 0x04 | 0x0B) {
                self.input_cnt = 0;
            }
            return;
        }
        if self.input_cnt == 5 && self.input_buf[1] == 0x04 {
            self.input_cnt = 0;
            if self.input_buf[4] != 0x0E && self.input_buf[4] != 0x0F {
                return;
            }
            self.attrs &= !(CHAR_ATTR_BRIGHT | CHAR_ATTR_BLINK | CHAR_ATTR_INV);
            self.attr_under = false;
            if self.input_buf[2] == 0x02 || self.input_buf[2] == 0x0B {
                self.attrs |= CHAR_ATTR_BRIGHT;
            }
            if self.input_buf[2] == 0x04 || self.input_buf[2] == 0x0B {
                self.attrs |= CHAR_ATTR_BLINK;
            }
            if self.input_buf[3] == 0x02 || self.input_buf[3] == 0x0B {
                self.attrs |= CHAR_ATTR_INV;
            }
            if self.input_buf[3] == 0x04 || self.input_buf[3] == 0x0B {
                self.attr_under = true;
            }
            self.attr_on = self.input_buf[4] == 0x0E;
            self.attr_temp = false;
            return;
        }

        // return the self-ID string: 02 08 09 0F
        if self.input_cnt == 4 && self.input_buf[1] == 0x08 {
            if self.input_buf[2] == 0x09 && self.input_buf[3] == 0x0F {
                let id: Vec<u8> = ID_STRING.bytes().skip(1).collect();
                for ch in id {
                    self.receive_keystroke(u16::from(ch));
                }
                self.receive_keystroke(0x0D);
            }
            self.input_cnt = 0;
            return;
        }

        // draw/erase box mode.  the box prefix stays in the buffer and
        // each verb is dropped after it runs, since the full command
        // string can be very long.
        if self.input_cnt == 3 && self.input_buf[1] == 0x0B {
            if self.input_buf[2] != 0x02 && self.input_buf[2] != 0x0B {
                self.input_cnt = 0; // must open with 02 0B 02 or 02 0B 0B
                return;
            }
            // the bottom edge is drawn by 08 only once a 0B has been seen
            self.box_bottom = false;
            return;
        }
        if self.input_cnt == 4 && self.input_buf[1] == 0x0B {
            let box_draw = self.input_buf[2] == 0x02;
            self.input_cnt -= 1; // drop the verb byte
            match byte {
                0x08 => {
                    // move left; draw the top edge under old and new cell
                    if self.box_bottom {
                        self.set_box_attr(box_draw, CHAR_ATTR_LEFT, 1);
                    }
                    self.adjust_cursor_x(-1);
                    if self.box_bottom {
                        self.set_box_attr(box_draw, CHAR_ATTR_RIGHT, 1);
                    }
                }
                0x09 => {
                    // move right; top edge at old then new position
                    self.set_box_attr(box_draw, CHAR_ATTR_RIGHT, 0);
                    self.adjust_cursor_x(1);
                    self.set_box_attr(box_draw, CHAR_ATTR_LEFT, 0);
                }
                0x0A => {
                    self.adjust_cursor_y(1);
                    self.set_box_attr(box_draw, CHAR_ATTR_VERT, 0);
                }
                0x0B => {
                    self.set_box_attr(box_draw, CHAR_ATTR_VERT, 0);
                    self.box_bottom = true; // subsequent 08 draws the bottom
                }
                0x0C => {
                    self.adjust_cursor_y(-1);
                    self.set_box_attr(box_draw, CHAR_ATTR_VERT, 0);
                }
                _ => {
                    // 0x0F ends box mode; anything else drops out of it
                    self.input_cnt = 0;
                }
            }
            return;
        }

        // reinitialize terminal: 02 0D 0C 03 0F clears the screen, homes
        // and enables the cursor, and restores default attributes
        if self.input_cnt == 3 && self.input_buf[1] == 0x0D && self.input_buf[2] != 0x0C {
            self.input_cnt = 0;
            return;
        }
        if self.input_cnt == 4
            && self.input_buf[1] == 0x0D
            && self.input_buf[2] == 0x0C
            && self.input_buf[3] != 0x03
        {
            self.input_cnt = 0;
            return;
        }
        if self.input_cnt == 5
            && self.input_buf[1] == 0x0D
            && self.input_buf[2] == 0x0C
            && self.input_buf[3] == 0x03
            && self.input_buf[4] == 0x0F
        {
            // a logged real 2336 clears the CRT without any return code
            self.input_cnt = 0;
            self.reset_crt();
            return;
        }

        if self.input_cnt >= 5 {
            self.input_cnt = 0;
        }
    }

    // lowest level: control codes and printable characters
    fn process_crt_char3(&mut self, byte: u8) {
        match byte {
            0x00 | 0x02 | 0x04 | 0x0B | 0x0E | 0x0F => {
                // ignored
            }
            0x01 => {
                // home cursor
                self.disp.curs_x = 0;
                self.disp.curs_y = 0;
            }
            0x03 => self.clear_screen(),
            0x05 => self.disp.curs_attr = CursorMode::On,
            0x06 => self.disp.curs_attr = CursorMode::Off,
            0x07 => self.dings += 1, // bell
            0x08 => self.adjust_cursor_x(-1),
            0x09 => self.adjust_cursor_x(1), // horizontal tab
            0x0A => self.adjust_cursor_y(1), // linefeed
            0x0C => self.adjust_cursor_y(-1), // reverse index
            0x0D => self.disp.curs_x = 0,
            _ => {
                let use_alt = byte >= 0x80 && self.attrs & CHAR_ATTR_ALT != 0;
                let use_underline =
                    (byte >= 0x90 && !use_alt) || (self.attr_under && (self.attr_on || self.attr_temp));

                let glyph = (byte & 0x7F) | if use_underline { 0x80 } else { 0x00 };
                let (x, y) = (self.disp.curs_x, self.disp.curs_y);
                self.screen_write_char(x, y, glyph);

                // the box bits at the cell survive; the rest follow the
                // active attribute state
                let idx = (self.disp.chars_w * y + x) as usize;
                let old =
                    self.disp.attr[idx] & (CHAR_ATTR_LEFT | CHAR_ATTR_RIGHT | CHAR_ATTR_VERT);

                let mut attr_mask = 0;
                if !self.attr_on && !self.attr_temp {
                    attr_mask |= CHAR_ATTR_BLINK | CHAR_ATTR_BRIGHT | CHAR_ATTR_INV;
                }
                if !use_alt {
                    attr_mask |= CHAR_ATTR_ALT;
                }

                self.screen_write_attr(x, y, old | (self.attrs & !attr_mask));
                self.adjust_cursor_x(1);
            }
        }

        self.disp.dirty = true;
    }

    // ----------------------------------------------------------------
    // printer receive parsing
    // ----------------------------------------------------------------

    fn prt_char_fifo(&mut self, byte: u8) {
        match self.prt_sink.as_mut() {
            Some(sink) => sink(byte),
            None => debug!("terminal {} prt byte 0x{:02x} dropped", self.term_num, byte),
        }
    }
}

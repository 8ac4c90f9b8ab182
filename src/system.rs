// The machine under emulation as one owned value: scheduler, CPU, I/O bus
// and slot table, keyboard routing, and the time-slice driver that keeps
// every clocked device in lockstep while pacing against the wall clock.

use crate::bus::{IoBus, IoBusPtr};
use crate::config::{CardKind, SysCfg};
use crate::config::ConfigError;
use crate::cpu_t::Cpu2200T;
use crate::cpu_vp::Cpu2200Vp;
use crate::devices::{IoCardDisplay, IoCardKeyboard, IoCardPrinter, IoCardDisk};
use crate::fields::{CpuStatus, Exec};
use crate::processor::Cpu2200;
use crate::scheduler::{self, Scheduler, SchedulerPtr};
use crate::terminal::{ScreenType, TerminalPtr};
use crate::termmux::IoCardTermMux;
use log::warn;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

// duration of one emulated timeslice.  this interacts unholily with host
// scheduling; small changes have non-monotonic performance impact.
const SLICE_MS: i64 = 30;

// sentinel op cost returned when a clocked device fails
const EXEC_ERR_NS: u32 = 1 << 30;

// number of timeslices of wall-start history kept for speed reporting
const PERF_HIST_SIZE: usize = 100;

// a device advanced by the clock: the core CPU, plus any peripheral with
// its own microprocessor.  each keeps a ns counter that is rebased toward
// zero every slice; only the differences between devices matter.
struct ClockedDevice {
    callback: Box<dyn FnMut() -> u32>,
    ns: u32,
}

// keyboard input routing: the host addresses a key to (io_addr, term)
enum KbTarget {
    Keyboard(Rc<RefCell<IoCardKeyboard>>),
    Terminal(TerminalPtr),
}

struct KbRoute {
    io_addr: u8,
    term_num: usize,
    target: KbTarget,
    script: Option<ScriptFile>,
}

// a keyboard script: text fed to the machine as if typed
pub struct ScriptFile {
    bytes: VecDeque<u16>,
}

impl ScriptFile {
    pub fn open(path: &Path) -> io::Result<ScriptFile> {
        let text = fs::read_to_string(path)?;
        let mut bytes = VecDeque::new();
        for ch in text.chars() {
            match ch {
                '\n' => bytes.push_back(0x0D),
                '\r' => {}
                c if (c as u32) < 0x80 => bytes.push_back(c as u16),
                _ => {} // non-ascii has no 2200 keycode
            }
        }
        Ok(ScriptFile { bytes })
    }
}

pub struct System {
    cfg: SysCfg,
    scheduler: SchedulerPtr,
    bus: IoBusPtr,
    cpu: Rc<RefCell<dyn Cpu2200>>,
    clocked: Vec<ClockedDevice>,
    kb_routes: Vec<KbRoute>,
    terminals: Vec<TerminalPtr>,
    printers: Vec<(u8, Rc<RefCell<IoCardPrinter>>)>,
    disks: Vec<(usize, Rc<RefCell<IoCardDisk>>)>,
    regulated: Rc<Cell<bool>>,
    freeze: bool,

    // ----- speed regulation -----
    epoch: Instant,
    first_slice: bool,
    realtime_start: i64,
    real_seconds: i64,
    sim_time_ms: i64,     // actual simulated time
    adj_sim_time_ms: i64, // fudged for pauses so we don't sprint to catch up
    sim_secs: u32,
    perf_real_ms: [i64; PERF_HIST_SIZE],
    perf_hist_len: usize,
    perf_hist_ptr: usize,
    sim_seconds_cb: Option<Box<dyn FnMut(u32, f32)>>,
}

impl System {
    pub fn new(cfg: SysCfg) -> Result<System, ConfigError> {
        cfg.validate()?;

        let scheduler: SchedulerPtr = Rc::new(RefCell::new(Scheduler::new()));
        let bus = IoBus::new(cfg.warn_io);
        let regulated = Rc::new(Cell::new(cfg.speed_regulated));

        // (re)build the CPU, loading whatever images the config names
        let cpu: Rc<RefCell<dyn Cpu2200>> = if cfg.cpu.is_vp_family() {
            let mut c = Cpu2200Vp::new(Rc::clone(&scheduler), Rc::clone(&bus), cfg.ram_kb);
            if let Some(f) = &cfg.ucode_file {
                c.load_ucode(0, &fs::read(f)?).unwrap_or_else(|e| warn!("{}", e));
            }
            Rc::new(RefCell::new(c))
        } else {
            let mut c = Cpu2200T::new(Rc::clone(&scheduler), Rc::clone(&bus), cfg.ram_kb);
            if let Some(f) = &cfg.ucode_file {
                c.load_ucode(0, &fs::read(f)?).unwrap_or_else(|e| warn!("{}", e));
            }
            if let Some(f) = &cfg.krom_file {
                c.load_krom(&fs::read(f)?);
            }
            Rc::new(RefCell::new(c))
        };
        let lines = cpu.borrow().lines();

        let mut clocked: Vec<ClockedDevice> = Vec::new();
        let cpu_cb = Rc::clone(&cpu);
        clocked.push(ClockedDevice {
            callback: Box::new(move || match cpu_cb.borrow_mut().exec_one_op() {
                Exec::Op { ns } => ns,
                Exec::Halted | Exec::Illegal { .. } => EXEC_ERR_NS,
            }),
            ns: 0,
        });

        // populate the backplane
        let mut kb_routes: Vec<KbRoute> = Vec::new();
        let mut terminals: Vec<TerminalPtr> = Vec::new();
        let mut printers: Vec<(u8, Rc<RefCell<IoCardPrinter>>)> = Vec::new();
        let mut disks: Vec<(usize, Rc<RefCell<IoCardDisk>>)> = Vec::new();

        for (slot, scfg) in cfg.slots.iter().enumerate() {
            let kind = match scfg.card {
                Some(k) => k,
                None => continue,
            };
            let base = (scfg.addr & 0xFF) as u8;
            match kind {
                CardKind::Keyboard => {
                    let card = IoCardKeyboard::new(lines.clone(), base);
                    bus.borrow_mut().install_card(slot, card.clone());
                    kb_routes.push(KbRoute {
                        io_addr: base,
                        term_num: 0,
                        target: KbTarget::Keyboard(card),
                        script: None,
                    });
                }
                CardKind::Disp64x16 | CardKind::Disp80x24 => {
                    let screen = if kind == CardKind::Disp64x16 {
                        ScreenType::Crt64x16
                    } else {
                        ScreenType::Crt80x24
                    };
                    let card = IoCardDisplay::new(
                        Rc::clone(&scheduler),
                        lines.clone(),
                        base,
                        screen,
                        Rc::clone(&regulated),
                    );
                    terminals.push(card.borrow().terminal());
                    bus.borrow_mut().install_card(slot, card);
                }
                CardKind::Printer => {
                    let card = IoCardPrinter::new(lines.clone(), base);
                    printers.push((base, card.clone()));
                    bus.borrow_mut().install_card(slot, card);
                }
                CardKind::Disk => {
                    let card = IoCardDisk::new(lines.clone(), base);
                    disks.push((slot, card.clone()));
                    bus.borrow_mut().install_card(slot, card);
                }
                CardKind::TermMux => {
                    let n_terms = scfg.num_terminals.unwrap_or(1);
                    let card =
                        IoCardTermMux::new(Rc::clone(&scheduler), lines.clone(), base, n_terms);
                    if let Some(f) = &scfg.eprom_file {
                        card.borrow_mut().load_eprom(&fs::read(f)?);
                    }
                    for term in card.borrow().terminals() {
                        let term_num = term.borrow().term_num();
                        kb_routes.push(KbRoute {
                            // 0x01 is the vp-mode keyboard offset
                            io_addr: base.wrapping_add(0x01),
                            term_num,
                            target: KbTarget::Terminal(Rc::clone(&term)),
                            script: None,
                        });
                        terminals.push(term);
                    }
                    let mux_cb = Rc::clone(&card);
                    clocked.push(ClockedDevice {
                        callback: Box::new(move || mux_cb.borrow_mut().exec_one_op()),
                        ns: 0,
                    });
                    bus.borrow_mut().install_card(slot, card);
                }
            }
        }

        Ok(System {
            cfg,
            scheduler,
            bus,
            cpu,
            clocked,
            kb_routes,
            terminals,
            printers,
            disks,
            regulated,
            freeze: false,
            epoch: Instant::now(),
            first_slice: true,
            realtime_start: 0,
            real_seconds: 0,
            sim_time_ms: 0,
            adj_sim_time_ms: 0,
            sim_secs: 0,
            perf_real_ms: [0; PERF_HIST_SIZE],
            perf_hist_len: 0,
            perf_hist_ptr: 0,
            sim_seconds_cb: None,
        })
    }

    pub fn config(&self) -> &SysCfg {
        &self.cfg
    }

    pub fn scheduler(&self) -> SchedulerPtr {
        Rc::clone(&self.scheduler)
    }

    // the installed micromachine; hosts use this to feed microcode or
    // constant rom images after construction
    pub fn cpu(&self) -> Rc<RefCell<dyn Cpu2200>> {
        Rc::clone(&self.cpu)
    }

    pub fn terminals(&self) -> &[TerminalPtr] {
        &self.terminals
    }

    pub fn set_sim_seconds_callback(&mut self, cb: Box<dyn FnMut(u32, f32)>) {
        self.sim_seconds_cb = Some(cb);
    }

    pub fn set_printer_sink(&mut self, io_addr: u8, sink: Box<dyn FnMut(u8)>) {
        for (addr, card) in &self.printers {
            if *addr == io_addr {
                card.borrow_mut().set_sink(sink);
                return;
            }
        }
    }

    pub fn disk_card(&self, slot: usize) -> Option<Rc<RefCell<IoCardDisk>>> {
        self.disks.iter().find(|(s, _)| *s == slot).map(|(_, c)| c.clone())
    }

    // change configuration; minor changes apply in place, anything
    // structural quiesces and rebuilds the machine
    pub fn set_config(&mut self, newcfg: SysCfg) -> Result<(), ConfigError> {
        newcfg.validate()?;
        if !self.cfg.needs_reboot(&newcfg) {
            self.regulated.set(newcfg.speed_regulated);
            self.bus.borrow_mut().set_warn_io(newcfg.warn_io);
            self.cfg = newcfg;
            return Ok(());
        }
        // tear down: drop pending timers first so their card references
        // don't keep the old machine alive
        self.scheduler.borrow_mut().clear();
        self.bus.borrow_mut().breakdown_cards();
        let cb = self.sim_seconds_cb.take();
        *self = System::new(newcfg)?;
        self.sim_seconds_cb = cb;
        Ok(())
    }

    pub fn regulate_cpu_speed(&mut self, regulated: bool) {
        self.cfg.speed_regulated = regulated;
        self.regulated.set(regulated);
        self.perf_hist_len = 0;
        self.perf_hist_ptr = 0;
    }

    pub fn is_cpu_speed_regulated(&self) -> bool {
        self.regulated.get()
    }

    pub fn freeze_emu(&mut self, freeze: bool) {
        self.freeze = freeze;
    }

    // reset the cpu and every card
    pub fn reset(&mut self, hard: bool) {
        self.bus.borrow_mut().deselect_all();
        self.cpu.borrow_mut().reset(hard);
        let cards: Vec<_> =
            (0..crate::bus::NUM_IOSLOTS).filter_map(|s| self.bus.borrow().card_in_slot(s)).collect();
        for card in cards {
            card.borrow_mut().reset(hard);
        }
    }

    // ------------------------------------------------------------
    // keyboard routing and script playback
    // ------------------------------------------------------------

    pub fn dispatch_keystroke(&mut self, io_addr: u8, term_num: usize, keycode: u16) {
        for route in &mut self.kb_routes {
            if route.io_addr == io_addr && route.term_num == term_num {
                match &route.target {
                    KbTarget::Keyboard(card) => card.borrow_mut().receive_keystroke(keycode),
                    KbTarget::Terminal(term) => term.borrow_mut().receive_keystroke(keycode),
                }
                return;
            }
        }
    }

    // the default input route: the first registered keyboard
    pub fn default_kb_route(&self) -> Option<(u8, usize)> {
        self.kb_routes.first().map(|r| (r.io_addr, r.term_num))
    }

    pub fn invoke_script(&mut self, io_addr: u8, term_num: usize, path: &Path) -> io::Result<bool> {
        for route in &mut self.kb_routes {
            if route.io_addr == io_addr && route.term_num == term_num {
                route.script = Some(ScriptFile::open(path)?);
                return Ok(true);
            }
        }
        Ok(false)
    }

    // feed attached scripts toward their targets, at most a few bytes per
    // slice and only while the target's queue is shallow
    fn pump_scripts(&mut self) {
        let active = self.kb_routes.iter().filter(|r| r.script.is_some()).count();
        for route in &mut self.kb_routes {
            let done = match (&mut route.script, &route.target) {
                (Some(script), KbTarget::Keyboard(card)) => {
                    if card.borrow().script_can_accept() {
                        if let Some(code) = script.bytes.pop_front() {
                            card.borrow_mut().receive_keystroke(code);
                        }
                    }
                    script.bytes.is_empty()
                }
                (Some(script), KbTarget::Terminal(term)) => {
                    term.borrow_mut().set_script_active(true, active);
                    while term.borrow().script_can_accept() && !script.bytes.is_empty() {
                        if let Some(code) = script.bytes.pop_front() {
                            term.borrow_mut().receive_keystroke(code);
                        }
                    }
                    script.bytes.is_empty()
                }
                _ => false,
            };
            if done {
                route.script = None;
                if let KbTarget::Terminal(term) = &route.target {
                    term.borrow_mut().set_script_active(false, 0);
                }
            }
        }
    }

    // ------------------------------------------------------------
    // the time-slice driver
    // ------------------------------------------------------------

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    // called whenever the host has free time; returns whether more idle
    // events are wanted
    pub fn on_idle(&mut self) -> bool {
        if self.freeze {
            // without the sleep we'd peg the host CPU on idle events
            std::thread::sleep(std::time::Duration::from_millis(10));
            return true;
        }
        self.emulate_timeslice(SLICE_MS);
        self.pump_scripts();
        true
    }

    // simulate one timeslice's worth of instructions
    pub fn emulate_timeslice(&mut self, ts_ms: i64) {
        let num_devices = self.clocked.len();

        // try to stay within this window of realtime
        let adj_window = 10 * ts_ms;

        if self.cpu.borrow().status() != CpuStatus::Running {
            return;
        }

        let now_ms = self.now_ms();
        if self.first_slice {
            self.first_slice = false;
            self.realtime_start = now_ms;
        }
        let realtime_elapsed = now_ms - self.realtime_start;
        let mut offset = self.adj_sim_time_ms - realtime_elapsed;

        if offset > adj_window {
            // way ahead, probably running unregulated
            self.adj_sim_time_ms = realtime_elapsed + adj_window;
            offset = adj_window;
        } else if offset < -adj_window {
            // fallen way behind; snap forward so we don't run like mad
            // after a substantial pause
            self.adj_sim_time_ms = realtime_elapsed - adj_window;
        }

        if offset > 0 && self.regulated.get() {
            // running ahead of schedule: kill some time, but not all of
            // it since sleep may well sleep longer than asked
            let ioffset = (offset & 0xFFF) as u64;
            std::thread::sleep(std::time::Duration::from_millis(ioffset / 2));
            return;
        }

        // track when each slice started
        self.perf_real_ms[self.perf_hist_ptr] = now_ms;
        self.perf_hist_ptr = (self.perf_hist_ptr + 1) % PERF_HIST_SIZE;
        if self.perf_hist_len < PERF_HIST_SIZE {
            self.perf_hist_len += 1;
        }

        let mut slice_ns: i64 = ts_ms * 1_000_000;
        if num_devices == 1 {
            while slice_ns > 0 {
                let op_ns = (self.clocked[0].callback)();
                if op_ns > 10000 {
                    slice_ns = 0; // device error: finish the timeslice
                } else {
                    slice_ns -= i64::from(op_ns);
                    scheduler::timer_tick(&self.scheduler, op_ns);
                }
            }
        } else {
            // keep the devices in time lockstep: always step the one most
            // behind, clamping world time to the next device's position
            let mut order: Vec<usize> = (0..num_devices).collect();
            order.sort_by_key(|&i| self.clocked[i].ns);

            // rebase all counters toward zero once per slice so the 32b
            // counters can't overflow
            let rebase = self.clocked[order[0]].ns;
            for dev in self.clocked.iter_mut() {
                dev.ns -= rebase;
            }

            while slice_ns > 0 {
                let idx0 = order[0];
                let op_ns = (self.clocked[idx0].callback)();
                if op_ns > 50000 {
                    slice_ns = 0; // device error: finish the timeslice
                } else {
                    let clamp_ns = self.clocked[order[1]].ns - self.clocked[idx0].ns;
                    let delta_ns = op_ns.min(clamp_ns);
                    slice_ns -= i64::from(delta_ns);
                    scheduler::timer_tick(&self.scheduler, delta_ns);
                    let new_ns = self.clocked[idx0].ns + op_ns;
                    self.clocked[idx0].ns = new_ns;
                    let mut i = 0;
                    while i < num_devices - 1 && self.clocked[order[i + 1]].ns < new_ns {
                        order[i] = order[i + 1];
                        i += 1;
                    }
                    order[i] = idx0;
                }
            }
        }

        self.sim_time_ms += ts_ms;
        self.adj_sim_time_ms += ts_ms;

        if self.cpu.borrow().status() != CpuStatus::Running {
            warn!("CPU halted -- must reset");
            self.reset(true);
            return;
        }

        self.sim_secs = (self.sim_time_ms / 1000) as u32;

        let real_seconds_now = realtime_elapsed / 1000;
        if self.real_seconds != real_seconds_now {
            self.real_seconds = real_seconds_now;
            if self.perf_hist_len > 10 {
                // running average over the last real second or so
                let n1 = (self.perf_hist_ptr + PERF_HIST_SIZE - 1) % PERF_HIST_SIZE;
                let mut ms_diff: i64 = 0;
                let mut slices = 0;
                let mut n = 1;
                while n < self.perf_hist_len {
                    let n0 = (n1 + PERF_HIST_SIZE - n) % PERF_HIST_SIZE;
                    slices = n;
                    ms_diff = self.perf_real_ms[n1] - self.perf_real_ms[n0];
                    if ms_diff > 1000 {
                        break;
                    }
                    n += 10;
                }
                if ms_diff > 0 {
                    let relative_speed = (slices as i64 * ts_ms) as f32 / ms_diff as f32;
                    let secs = self.sim_secs;
                    if let Some(cb) = self.sim_seconds_cb.as_mut() {
                        cb(secs, relative_speed);
                    }
                }
            }
        }

        // at least yield so we don't hog the whole host
        std::thread::yield_now();
    }
}

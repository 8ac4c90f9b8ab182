// The strobed parallel I/O bus: a 256-entry map from address to the card
// claiming it, a single selected-address latch, and the dispatch of the
// CPU-side strobes to whichever card is selected.
//
// Dispatch clones the card handle out of the slot table and drops the bus
// borrow before calling into the card, so a card is free to reach back to
// the bus or the scheduler while it services a strobe.

use crate::devices::IoCard;
use log::warn;
use std::cell::RefCell;
use std::rc::Rc;

pub const NUM_IOSLOTS: usize = 8;

pub type CardPtr = Rc<RefCell<dyn IoCard>>;
pub type IoBusPtr = Rc<RefCell<IoBus>>;

#[derive(Clone, Copy)]
struct IoMapEntry {
    slot: Option<usize>,
    ignore: bool, // once warned about, an unmapped address goes quiet
}

pub struct IoBus {
    iomap: [IoMapEntry; 256],
    slots: Vec<Option<CardPtr>>,
    cur_io_addr: Option<u8>, // address of the most recent ABS
    warn_io: bool,
}

impl IoBus {
    pub fn new(warn_io: bool) -> IoBusPtr {
        Rc::new(RefCell::new(IoBus {
            iomap: [IoMapEntry { slot: None, ignore: false }; 256],
            slots: (0..NUM_IOSLOTS).map(|_| None).collect(),
            cur_io_addr: None,
            warn_io,
        }))
    }

    pub fn set_warn_io(&mut self, warn: bool) {
        self.warn_io = warn;
    }

    // claim every address the card responds to; the configuration layer
    // has already refused overlapping maps
    pub fn install_card(&mut self, slot: usize, card: CardPtr) {
        let addresses = card.borrow().get_addresses();
        for addr in addresses {
            self.iomap[addr as usize].slot = Some(slot);
        }
        self.slots[slot] = Some(card);
    }

    pub fn card_in_slot(&self, slot: usize) -> Option<CardPtr> {
        self.slots[slot].clone()
    }

    // tear down all card associations and restore the warning flags
    pub fn breakdown_cards(&mut self) {
        for entry in self.iomap.iter_mut() {
            entry.slot = None;
            entry.ignore = false;
        }
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.cur_io_addr = None;
    }

    pub fn deselect_all(&mut self) {
        self.cur_io_addr = None;
    }

    pub fn selected_addr(&self) -> Option<u8> {
        self.cur_io_addr
    }

    fn card_at(&self, addr: u8) -> Option<CardPtr> {
        self.iomap[addr as usize].slot.and_then(|s| self.slots[s].clone())
    }

    fn selected_card(&self) -> Option<CardPtr> {
        self.cur_io_addr.and_then(|a| self.card_at(a))
    }
}

// address bus strobe: the previously selected card (if any, and if the
// address changed) sees deselect before the new one sees select
pub fn cpu_abs(bus: &IoBusPtr, addr: u8) {
    let (prev, next, warn_addr) = {
        let mut b = bus.borrow_mut();
        let prev = match b.cur_io_addr {
            Some(cur) if cur != addr => b.card_at(cur),
            _ => None,
        };
        b.cur_io_addr = Some(addr);
        let next = b.card_at(addr);
        let mut warn_addr = None;
        if next.is_none() {
            let entry = &mut b.iomap[addr as usize];
            if !entry.ignore {
                entry.ignore = true;
                warn_addr = Some(addr);
            }
        }
        (prev, next, if b.warn_io { warn_addr } else { None })
    };

    if let Some(card) = prev {
        card.borrow_mut().deselect();
    }
    if let Some(card) = next {
        card.borrow_mut().select(addr);
    } else if let Some(a) = warn_addr {
        warn!("I/O access to unoccupied address 0x{:02X}", a);
    }
}

pub fn cpu_obs(bus: &IoBusPtr, byte: u8) {
    let card = bus.borrow().selected_card();
    if let Some(card) = card {
        card.borrow_mut().obs(byte);
    }
}

pub fn cpu_cbs(bus: &IoBusPtr, byte: u8) {
    let card = bus.borrow().selected_card();
    if let Some(card) = card {
        card.borrow_mut().cbs(byte);
    }
}

pub fn cpu_poll_ib5(bus: &IoBusPtr) -> bool {
    let card = bus.borrow().selected_card();
    match card {
        Some(card) => card.borrow().ib5(),
        None => false,
    }
}

pub fn cpu_cpb(bus: &IoBusPtr, busy: bool) {
    let card = bus.borrow().selected_card();
    if let Some(card) = card {
        card.borrow_mut().cpb(busy);
    }
}

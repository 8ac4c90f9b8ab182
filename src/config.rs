// The system configuration model: which CPU, how much RAM, what card sits
// in which backplane slot, and the handful of one-off switches.  The model
// can compare itself, judge whether a transition needs a full reboot of
// the emulated machine, validate itself before anything is committed, and
// round-trip through TOML for the host's persistence layer.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const NUM_IOSLOTS: usize = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("there must be a keyboard controller at address 0x01")]
    MissingKeyboard,
    #[error("there must be a CRT controller at address 0x05")]
    MissingCrt,
    #[error("cards in slots {0} and {1} both respond to address 0x{2:02X}")]
    AddressConflict(usize, usize, u8),
    #[error("{0} KB is not a legal memory size for a {1}")]
    BadRamSize(usize, &'static str),
    #[error("terminal mux in slot {0} must have 1..4 terminals")]
    BadTermCount(usize),
    #[error("configuration file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("configuration serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuKind {
    #[serde(rename = "2200B")]
    Cpu2200B,
    #[serde(rename = "2200T")]
    Cpu2200T,
    #[serde(rename = "VP")]
    CpuVp,
    #[serde(rename = "MVP")]
    CpuMvp,
    #[serde(rename = "MVPC")]
    CpuMvpC,
    #[serde(rename = "MICROVP")]
    CpuMicroVp,
}

impl CpuKind {
    pub fn label(self) -> &'static str {
        match self {
            CpuKind::Cpu2200B => "2200B",
            CpuKind::Cpu2200T => "2200T",
            CpuKind::CpuVp => "VP",
            CpuKind::CpuMvp => "MVP",
            CpuKind::CpuMvpC => "MVPC",
            CpuKind::CpuMicroVp => "MICROVP",
        }
    }

    // the first generation runs the nibble machine; everything else is
    // the byte machine
    pub fn is_vp_family(self) -> bool {
        !matches!(self, CpuKind::Cpu2200B | CpuKind::Cpu2200T)
    }

    // legal memory sizes in KB, smallest first
    pub fn ram_choices(self) -> &'static [usize] {
        match self {
            CpuKind::Cpu2200B => &[4, 8, 12, 16, 24, 32],
            CpuKind::Cpu2200T => &[8, 16, 24, 32],
            CpuKind::CpuVp => &[16, 32, 48, 64],
            CpuKind::CpuMvp => &[32, 64, 128, 256],
            CpuKind::CpuMvpC => &[32, 64, 128, 256, 512],
            CpuKind::CpuMicroVp => &[128, 256, 512, 1024, 2048],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Keyboard,
    Disp64x16,
    Disp80x24,
    Printer,
    Disk,
    TermMux,
}

impl CardKind {
    // the low-byte addresses an instance at the given base claims
    pub fn claimed_addresses(self, base: u16) -> Vec<u8> {
        let lo = (base & 0xFF) as u8;
        match self {
            CardKind::TermMux => (1..8).map(|i| lo.wrapping_add(i)).collect(),
            _ => vec![lo],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotCfg {
    pub card: Option<CardKind>,
    #[serde(default)]
    pub addr: u16,
    // terminal mux only: how many terminals hang off the card
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_terminals: Option<usize>,
    // terminal mux only: path of the controller EPROM image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eprom_file: Option<String>,
}

impl SlotCfg {
    fn empty() -> SlotCfg {
        SlotCfg { card: None, addr: 0, num_terminals: None, eprom_file: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysCfg {
    pub cpu: CpuKind,
    pub ram_kb: usize,
    pub speed_regulated: bool,
    pub disk_realtime: bool,
    pub warn_io: bool,
    // microcode / constant rom images; without them the machine idles.
    // plain values stay ahead of the slot tables for the TOML writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ucode_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub krom_file: Option<String>,
    pub slots: Vec<SlotCfg>,
}

impl SysCfg {
    // a reasonable default machine
    pub fn defaults() -> SysCfg {
        let mut slots: Vec<SlotCfg> = (0..NUM_IOSLOTS).map(|_| SlotCfg::empty()).collect();
        slots[0] = SlotCfg {
            card: Some(CardKind::Keyboard),
            addr: 0x001,
            num_terminals: None,
            eprom_file: None,
        };
        slots[1] = SlotCfg {
            card: Some(CardKind::Disp64x16),
            addr: 0x005,
            num_terminals: None,
            eprom_file: None,
        };
        slots[2] = SlotCfg {
            card: Some(CardKind::Printer),
            addr: 0x215,
            num_terminals: None,
            eprom_file: None,
        };
        SysCfg {
            cpu: CpuKind::Cpu2200T,
            ram_kb: 32,
            speed_regulated: true,
            disk_realtime: true,
            warn_io: true,
            slots,
            ucode_file: None,
            krom_file: None,
        }
    }

    pub fn load(path: &Path) -> Result<SysCfg, ConfigError> {
        let text = fs::read_to_string(path)?;
        let mut cfg: SysCfg = toml::from_str(&text)?;
        while cfg.slots.len() < NUM_IOSLOTS {
            cfg.slots.push(SlotCfg::empty());
        }
        cfg.slots.truncate(NUM_IOSLOTS);
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    // returns Ok if the configuration is valid and consistent;
    // commit must be refused otherwise
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cpu.ram_choices().contains(&self.ram_kb) {
            return Err(ConfigError::BadRamSize(self.ram_kb, self.cpu.label()));
        }

        let mut pri_kb_found = false;
        let mut pri_crt_found = false;

        for (n, slot) in self.slots.iter().enumerate() {
            let card = match slot.card {
                Some(c) => c,
                None => continue,
            };
            let lo = (slot.addr & 0xFF) as u8;

            if card == CardKind::Keyboard && lo == 0x01 {
                pri_kb_found = true;
            }
            if (card == CardKind::Disp64x16 || card == CardKind::Disp80x24) && lo == 0x05 {
                pri_crt_found = true;
            }
            // a term mux at base 0 covers both mandatory devices
            if card == CardKind::TermMux && lo == 0x00 {
                pri_kb_found = true;
                pri_crt_found = true;
            }

            if card == CardKind::TermMux {
                let n_terms = slot.num_terminals.unwrap_or(1);
                if !(1..=4).contains(&n_terms) {
                    return Err(ConfigError::BadTermCount(n));
                }
            }

            // refuse overlapping address maps
            for (n2, slot2) in self.slots.iter().enumerate().skip(n + 1) {
                let card2 = match slot2.card {
                    Some(c) => c,
                    None => continue,
                };
                for a in card.claimed_addresses(slot.addr) {
                    for a2 in card2.claimed_addresses(slot2.addr) {
                        if a == a2 {
                            return Err(ConfigError::AddressConflict(n, n2, a));
                        }
                    }
                }
            }
        }

        if !pri_kb_found {
            return Err(ConfigError::MissingKeyboard);
        }
        if !pri_crt_found {
            return Err(ConfigError::MissingCrt);
        }
        Ok(())
    }

    // true if switching from self to other requires tearing the machine
    // down; flipping the realtime/warning switches does not
    pub fn needs_reboot(&self, other: &SysCfg) -> bool {
        if self.cpu != other.cpu || self.ram_kb != other.ram_kb {
            return true;
        }
        for (a, b) in self.slots.iter().zip(other.slots.iter()) {
            if a.card != b.card {
                return true;
            }
            if a.card.is_some()
                && ((a.addr & 0xFF) != (b.addr & 0xFF)
                    || a.num_terminals != b.num_terminals
                    || a.eprom_file != b.eprom_file)
            {
                return true;
            }
        }
        false
    }
}

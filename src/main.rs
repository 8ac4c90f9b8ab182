// A small terminal front-end for the emulation core: paints the first
// emulated CRT into the hosting terminal with termion and feeds keystrokes
// back in.  Ctrl-Q quits, Ctrl-R is the Wang RESET sequence, Ctrl-T is
// HALT/STEP.  This stands in for the GUI layer, which is a host concern.

use anyhow::{Context, Result};
use em2200::devices::{KEYCODE_HALT, KEYCODE_RESET};
use em2200::terminal::CursorMode;
use em2200::{SysCfg, System};
use std::env;
use std::io::{stdout, Read, Write};
use std::path::Path;
use termion::async_stdin;
use termion::raw::IntoRawMode;
use termion::{clear, cursor};

fn main() -> Result<()> {
    env_logger::init();

    let cfg = match env::args().nth(1) {
        Some(path) => SysCfg::load(Path::new(&path))
            .with_context(|| format!("loading configuration {}", path))?,
        None => SysCfg::defaults(),
    };

    let mut system = System::new(cfg).context("building the machine")?;
    system.set_sim_seconds_callback(Box::new(|secs, speed| {
        log::info!("simulated {} s, {:.2}x realtime", secs, speed);
    }));

    let (kb_addr, kb_term) = system.default_kb_route().context("no keyboard route")?;

    let mut stdin = async_stdin().bytes();
    let mut screen = stdout().into_raw_mode().context("entering raw mode")?;
    write!(screen, "{}{}", clear::All, cursor::Hide)?;
    screen.flush()?;

    'outer: loop {
        system.on_idle();

        // drain pending host keys
        while let Some(Ok(byte)) = stdin.next() {
            match byte {
                0x11 => break 'outer,                                         // ctrl-Q
                0x12 => system.dispatch_keystroke(kb_addr, kb_term, KEYCODE_RESET), // ctrl-R
                0x14 => system.dispatch_keystroke(kb_addr, kb_term, KEYCODE_HALT),  // ctrl-T
                b => system.dispatch_keystroke(kb_addr, kb_term, u16::from(b)),
            }
        }

        // repaint the primary screen when it changed
        if let Some(term) = system.terminals().first() {
            let term = term.clone();
            let mut term = term.borrow_mut();
            for _ in 0..term.take_dings() {
                write!(screen, "\x07")?;
            }
            if term.take_dirty() {
                let disp = &term.disp;
                let w = disp.chars_w as usize;
                for row in 0..disp.chars_h as usize {
                    write!(screen, "{}", cursor::Goto(1, (row + 1) as u16))?;
                    let line: String = disp.display[row * w..(row + 1) * w]
                        .iter()
                        .map(|&b| {
                            let c = b & 0x7F;
                            if (0x20..0x7F).contains(&c) {
                                c as char
                            } else {
                                ' '
                            }
                        })
                        .collect();
                    write!(screen, "{}", line)?;
                }
                if disp.curs_attr != CursorMode::Off {
                    write!(
                        screen,
                        "{}",
                        cursor::Goto((disp.curs_x + 1) as u16, (disp.curs_y + 1) as u16)
                    )?;
                }
                screen.flush()?;
            }
        }
    }

    write!(screen, "{}{}{}", clear::All, cursor::Show, cursor::Goto(1, 1))?;
    screen.flush()?;
    Ok(())
}

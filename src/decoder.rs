//! Home + Triangle combo detection on a controller's event stream
//!
//! Events come from `evdev::Device::fetch_events`; only `EV_KEY` events on the
//! two tracked codes matter. Key values follow the kernel convention:
//! 0 = release, 1 = press, 2 = autorepeat.

use evdev::{InputEvent, InputEventKind, Key};
use std::io;

/// Key codes of the two buttons that make up the combo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComboCodes {
    pub home: u16,
    pub triangle: u16,
}

impl Default for ComboCodes {
    fn default() -> Self {
        Self {
            home: Key::BTN_MODE.code(),
            triangle: Key::BTN_NORTH.code(),
        }
    }
}

/// Per-controller button state machine
///
/// A press of a tracked button latches its flag; a release of either tracked
/// button clears both. When both flags are latched the combo fires once and
/// the state is cleared. Autorepeat never latches a flag, so a sustained hold
/// needs a release and a fresh press to fire again.
#[derive(Debug, Clone)]
pub struct ComboDetector {
    codes: ComboCodes,
    home_down: bool,
    triangle_down: bool,
}

impl ComboDetector {
    pub fn new(codes: ComboCodes) -> Self {
        Self {
            codes,
            home_down: false,
            triangle_down: false,
        }
    }

    /// Feed one event; returns true when the combo fires
    pub fn feed(&mut self, ev: &InputEvent) -> bool {
        let InputEventKind::Key(key) = ev.kind() else {
            return false;
        };

        let code = key.code();
        if code != self.codes.home && code != self.codes.triangle {
            return false;
        }

        match ev.value() {
            0 => {
                self.reset();
                return false;
            }
            1 => {}
            _ => return false,
        }

        if code == self.codes.home {
            self.home_down = true;
        } else {
            self.triangle_down = true;
        }

        if self.home_down && self.triangle_down {
            self.reset();
            return true;
        }

        false
    }

    pub fn reset(&mut self) {
        self.home_down = false;
        self.triangle_down = false;
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.home_down || self.triangle_down
    }
}

/// Blocking source of input events
pub trait EventSource {
    /// Wait for the next batch of events and hand each one to `sink`
    fn fetch(&mut self, sink: &mut dyn FnMut(&InputEvent)) -> io::Result<()>;
}

impl EventSource for evdev::Device {
    fn fetch(&mut self, sink: &mut dyn FnMut(&InputEvent)) -> io::Result<()> {
        for ev in self.fetch_events()? {
            sink(&ev);
        }
        Ok(())
    }
}

/// Feed events to `detector` until the source fails, calling `on_combo` each
/// time the combo fires
///
/// The returned error is the normal end of a stream: ENODEV once the
/// controller has gone away.
pub fn run_stream<E: EventSource + ?Sized>(
    source: &mut E,
    detector: &mut ComboDetector,
    mut on_combo: impl FnMut(),
) -> io::Error {
    loop {
        let fetched = source.fetch(&mut |ev: &InputEvent| {
            if detector.feed(ev) {
                on_combo();
            }
        });

        if let Err(e) = fetched {
            return e;
        }
    }
}

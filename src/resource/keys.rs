//! Keyboard names accepted from chat and their PC/AT (set 1) scancodes.

use std::fmt;

/// A key the audience may press by name or by character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    pub name: &'static str,
    make: &'static [u8],
    /// Character requires shift held (`!`, `A`, ...)
    shifted: bool,
}

const fn key(name: &'static str, make: &'static [u8]) -> Key {
    Key {
        name,
        make,
        shifted: false,
    }
}

const fn shift(name: &'static str, make: &'static [u8]) -> Key {
    Key {
        name,
        make,
        shifted: true,
    }
}

const LSHIFT_MAKE: u8 = 0x2a;
const PAUSE_SEQUENCE: &[u8] = &[0xe1, 0x1d, 0x45, 0xe1, 0x9d, 0xc5];

/// Every key in keyboard layout order.
pub const KEYBOARD: &[Key] = &[
    key("ESC", &[0x01]),
    key("1", &[0x02]),
    shift("!", &[0x02]),
    key("2", &[0x03]),
    shift("@", &[0x03]),
    key("3", &[0x04]),
    shift("#", &[0x04]),
    key("4", &[0x05]),
    shift("$", &[0x05]),
    key("5", &[0x06]),
    shift("%", &[0x06]),
    key("6", &[0x07]),
    shift("^", &[0x07]),
    key("7", &[0x08]),
    shift("&", &[0x08]),
    key("8", &[0x09]),
    shift("*", &[0x09]),
    key("9", &[0x0a]),
    shift("(", &[0x0a]),
    key("0", &[0x0b]),
    shift(")", &[0x0b]),
    key("-", &[0x0c]),
    shift("_", &[0x0c]),
    key("=", &[0x0d]),
    shift("+", &[0x0d]),
    key("BKSP", &[0x0e]),
    key("\x08", &[0x0e]),
    key("TAB", &[0x0f]),
    key("\t", &[0x0f]),
    key("q", &[0x10]),
    shift("Q", &[0x10]),
    key("w", &[0x11]),
    shift("W", &[0x11]),
    key("e", &[0x12]),
    shift("E", &[0x12]),
    key("r", &[0x13]),
    shift("R", &[0x13]),
    key("t", &[0x14]),
    shift("T", &[0x14]),
    key("y", &[0x15]),
    shift("Y", &[0x15]),
    key("u", &[0x16]),
    shift("U", &[0x16]),
    key("i", &[0x17]),
    shift("I", &[0x17]),
    key("o", &[0x18]),
    shift("O", &[0x18]),
    key("p", &[0x19]),
    shift("P", &[0x19]),
    key("[", &[0x1a]),
    shift("{", &[0x1a]),
    key("]", &[0x1b]),
    shift("}", &[0x1b]),
    key("ENTER", &[0x1c]),
    key("\r", &[0x1c]),
    key("\n", &[0x1c]),
    key("CTRL", &[0x1d]),
    key("a", &[0x1e]),
    shift("A", &[0x1e]),
    key("s", &[0x1f]),
    shift("S", &[0x1f]),
    key("d", &[0x20]),
    shift("D", &[0x20]),
    key("f", &[0x21]),
    shift("F", &[0x21]),
    key("g", &[0x22]),
    shift("G", &[0x22]),
    key("h", &[0x23]),
    shift("H", &[0x23]),
    key("j", &[0x24]),
    shift("J", &[0x24]),
    key("k", &[0x25]),
    shift("K", &[0x25]),
    key("l", &[0x26]),
    shift("L", &[0x26]),
    key(";", &[0x27]),
    shift(":", &[0x27]),
    key("'", &[0x28]),
    shift("\"", &[0x28]),
    key("`", &[0x29]),
    shift("~", &[0x29]),
    key("LSHIFT", &[LSHIFT_MAKE]),
    key("\\", &[0x2b]),
    shift("|", &[0x2b]),
    key("z", &[0x2c]),
    shift("Z", &[0x2c]),
    key("x", &[0x2d]),
    shift("X", &[0x2d]),
    key("c", &[0x2e]),
    shift("C", &[0x2e]),
    key("v", &[0x2f]),
    shift("V", &[0x2f]),
    key("b", &[0x30]),
    shift("B", &[0x30]),
    key("n", &[0x31]),
    shift("N", &[0x31]),
    key("m", &[0x32]),
    shift("M", &[0x32]),
    key(",", &[0x33]),
    shift("<", &[0x33]),
    key(".", &[0x34]),
    shift(">", &[0x34]),
    key("/", &[0x35]),
    shift("?", &[0x35]),
    key("RSHIFT", &[0x36]),
    key("PRTSC", &[0x37]),
    key("ALT", &[0x38]),
    key("SPACE", &[0x39]),
    key(" ", &[0x39]),
    key("CAPS", &[0x3a]),
    key("F1", &[0x3b]),
    key("F2", &[0x3c]),
    key("F3", &[0x3d]),
    key("F4", &[0x3e]),
    key("F5", &[0x3f]),
    key("F6", &[0x40]),
    key("F7", &[0x41]),
    key("F8", &[0x42]),
    key("F9", &[0x43]),
    key("F10", &[0x44]),
    key("F11", &[0x57]),
    key("F12", &[0x58]),
    key("NUM", &[0x45]),
    key("SCRL", &[0x46]),
    key("HOME", &[0x47]),
    key("UP", &[0x48]),
    key("PGUP", &[0x49]),
    key("MINUS", &[0x4a]),
    key("LEFT", &[0x4b]),
    key("CENTER", &[0x4c]),
    key("RIGHT", &[0x4d]),
    key("PLUS", &[0x4e]),
    key("END", &[0x4f]),
    key("DOWN", &[0x50]),
    key("PGDN", &[0x51]),
    key("INS", &[0x52]),
    key("DEL", &[0x53]),
    key("E_DIV", &[0xe0, 0x35]),
    key("E_ENTER", &[0xe0, 0x1c]),
    key("E_INS", &[0xe0, 0x52]),
    key("E_DEL", &[0xe0, 0x53]),
    key("E_HOME", &[0xe0, 0x47]),
    key("E_END", &[0xe0, 0x4f]),
    key("E_PGUP", &[0xe0, 0x49]),
    key("E_PGDN", &[0xe0, 0x51]),
    key("E_LEFT", &[0xe0, 0x4b]),
    key("E_RIGHT", &[0xe0, 0x4d]),
    key("E_UP", &[0xe0, 0x48]),
    key("E_DOWN", &[0xe0, 0x50]),
    key("RALT", &[0xe0, 0x38]),
    key("RCTRL", &[0xe0, 0x1d]),
    key("LWIN", &[0xe0, 0x5b]),
    key("RWIN", &[0xe0, 0x5c]),
    key("PAUSE", PAUSE_SEQUENCE),
];

/// Keys that are held down while the rest of a chord is pressed.
pub const MODIFIERS: &[&str] = &[
    "CTRL", "SHIFT", "LSHIFT", "RSHIFT", "ALT", "RALT", "RCTRL", "LWIN", "RWIN", "WIN",
];

impl Key {
    pub fn lookup(name: &str) -> Option<&'static Key> {
        KEYBOARD.iter().find(|k| k.name == name)
    }

    pub fn make_codes(&self) -> Vec<u8> {
        self.make.to_vec()
    }

    /// Release sequence. The prefix byte stays, the code gets the break bit.
    pub fn break_codes(&self) -> Vec<u8> {
        if self.make == PAUSE_SEQUENCE {
            // Pause has no break sequence
            return Vec::new();
        }
        match self.make {
            [0xe0, code] => vec![0xe0, code | 0x80],
            [code] => vec![code | 0x80],
            other => other.to_vec(),
        }
    }

    /// Scancodes for a full press and release, wrapping in shift when needed.
    pub fn tap_codes(&self) -> Vec<u8> {
        let mut codes = Vec::new();
        if self.shifted {
            codes.push(LSHIFT_MAKE);
        }
        codes.extend(self.make_codes());
        codes.extend(self.break_codes());
        if self.shifted {
            codes.push(LSHIFT_MAKE | 0x80);
        }
        codes
    }
}

/// A parsed `!press` request: modifiers to hold and keys to tap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyChord {
    pub hold: Vec<String>,
    pub press: Vec<String>,
}

impl KeyChord {
    pub fn is_empty(&self) -> bool {
        self.hold.is_empty() && self.press.is_empty()
    }

    /// Held keys followed by pressed keys, as reported back to chat.
    pub fn names(&self) -> Vec<String> {
        self.hold.iter().chain(self.press.iter()).cloned().collect()
    }

    /// Full scancode sequence: hold modifiers, tap keys, release modifiers.
    pub fn scancodes(&self) -> Vec<u8> {
        let held: Vec<&Key> = self.hold.iter().filter_map(|n| Key::lookup(n)).collect();
        let mut codes = Vec::new();
        for key in &held {
            codes.extend(key.make_codes());
        }
        for key in self.press.iter().filter_map(|n| Key::lookup(n)) {
            codes.extend(key.tap_codes());
        }
        for key in held.iter().rev() {
            codes.extend(key.break_codes());
        }
        codes
    }
}

impl fmt::Display for KeyChord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(" "))
    }
}

/// Parse key names. Names longer than one character are case-insensitive;
/// unknown names are skipped. `SHIFT` and `WIN` mean their left variants.
pub fn parse_keys<S: AsRef<str>>(keys: &[S]) -> KeyChord {
    let mut chord = KeyChord::default();
    for raw in keys {
        let raw = raw.as_ref();
        let name = if raw.chars().count() > 1 {
            raw.to_uppercase()
        } else {
            raw.to_string()
        };

        if MODIFIERS.contains(&name.as_str()) {
            let name = match name.as_str() {
                "SHIFT" | "WIN" => format!("L{name}"),
                _ => name,
            };
            if !chord.hold.contains(&name) {
                chord.hold.push(name);
            }
        } else if Key::lookup(&name).is_some() {
            chord.press.push(name);
        }
    }
    chord
}

/// Strip characters the guest keyboard can not produce.
pub fn sanitize_text(text: &str) -> String {
    text.chars().filter(|c| !matches!(c, '€' | '¡')).collect()
}

/// Named keys for the `!press` help text.
pub fn special_keys() -> String {
    KEYBOARD
        .iter()
        .filter(|k| k.name.chars().count() > 1)
        .map(|k| k.name)
        .collect::<Vec<_>>()
        .join(" | ")
}

use std::fmt;

/// A protocol violation. Whoever receives one closes the offending connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnection(pub &'static str);
impl Disconnection {
    pub fn new(reason: &'static str) -> Self {
        Self(reason)
    }
    pub fn reason(&self) -> &'static str {
        self.0
    }
}
impl fmt::Display for Disconnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol violation: {}", self.0)
    }
}
impl std::error::Error for Disconnection {}

macro_rules! id {
    {$($(#[$m:meta])* $name:ident($t:ty);)*} => {
        $(
            $(#[$m])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            pub struct $name(pub $t);
            impl $name {
                pub fn index(self) -> usize {
                    self.0 as usize
                }
            }
            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    fmt::Display::fmt(&self.0, f)
                }
            }
        )*
    };
}
id! {
    /// Slot of a live socket inside the network pump.
    Handle(u16);
    /// Server-side connection slot.
    ConnectionId(u16);
    ClientId(u16);
    CharacterId(u32);
}

/// Position of a subdivision (zone, tile) inside its parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Coordinates {
    pub x: u16,
    pub y: u16,
}
impl Coordinates {
    pub const fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }
}
impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

pub const USERNAME_LEN: usize = 32;
pub const USERNAME_MIN_LEN: usize = 3;

/// Account name, NUL padded to its fixed wire width.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Username([u8; USERNAME_LEN]);
impl Username {
    /// Accepts a padded field from the wire. `None` if shorter than
    /// `USERNAME_MIN_LEN` once the padding is stripped.
    pub fn from_padded(field: &[u8; USERNAME_LEN]) -> Option<Self> {
        let len = field.iter().position(|&b| b == 0).unwrap_or(USERNAME_LEN);
        if len < USERNAME_MIN_LEN {
            return None;
        }
        let mut name = [0; USERNAME_LEN];
        name[..len].copy_from_slice(&field[..len]);
        Some(Self(name))
    }
    pub fn new(name: &str) -> Option<Self> {
        let bytes = name.as_bytes();
        if bytes.len() > USERNAME_LEN || bytes.contains(&0) {
            return None;
        }
        let mut field = [0; USERNAME_LEN];
        field[..bytes.len()].copy_from_slice(bytes);
        Self::from_padded(&field)
    }
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(USERNAME_LEN);
        &self.0[..len]
    }
    pub fn padded(&self) -> &[u8; USERNAME_LEN] {
        &self.0
    }
}
impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}
impl fmt::Debug for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Username({self})")
    }
}

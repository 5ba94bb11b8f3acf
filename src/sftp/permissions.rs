//! Unix permission bits
//!
//! Nine access bits (owner/group/other x read/write/execute) plus the
//! setuid, setgid and sticky bits, convertible to the symbolic `rwxr-xr-x`
//! form and to 3-4 digit octal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SETUID: u16 = 0o4000;
const SETGID: u16 = 0o2000;
const STICKY: u16 = 0o1000;
const ALL_BITS: u16 = 0o7777;

/// Access class within a permission set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Owner,
    Group,
    Other,
}

impl Class {
    fn shift(self) -> u16 {
        match self {
            Class::Owner => 6,
            Class::Group => 3,
            Class::Other => 0,
        }
    }
}

/// Read/write/execute flags of one [`Class`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Access {
    fn from_bits(bits: u16) -> Self {
        Self {
            read: bits & 0o4 != 0,
            write: bits & 0o2 != 0,
            execute: bits & 0o1 != 0,
        }
    }

    fn bits(self) -> u16 {
        (u16::from(self.read) << 2) | (u16::from(self.write) << 1) | u16::from(self.execute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionSet(u16);

impl PermissionSet {
    /// Keep the permission bits of a raw `st_mode`, dropping the file type.
    pub fn from_mode(mode: u32) -> Self {
        Self((mode & u32::from(ALL_BITS)) as u16)
    }

    pub fn mode(self) -> u32 {
        u32::from(self.0)
    }

    pub fn access(self, class: Class) -> Access {
        Access::from_bits((self.0 >> class.shift()) & 0o7)
    }

    pub fn with_access(self, class: Class, access: Access) -> Self {
        let shift = class.shift();
        Self((self.0 & !(0o7 << shift)) | (access.bits() << shift))
    }

    pub fn setuid(self) -> bool {
        self.0 & SETUID != 0
    }

    pub fn setgid(self) -> bool {
        self.0 & SETGID != 0
    }

    pub fn sticky(self) -> bool {
        self.0 & STICKY != 0
    }

    pub fn with_special(self, setuid: bool, setgid: bool, sticky: bool) -> Self {
        let mut bits = self.0 & 0o777;
        if setuid {
            bits |= SETUID;
        }
        if setgid {
            bits |= SETGID;
        }
        if sticky {
            bits |= STICKY;
        }
        Self(bits)
    }

    /// Nine-character symbolic form, e.g. `rwsr-x--T`.
    pub fn to_symbolic(self) -> String {
        let mut out = String::with_capacity(9);
        for (class, special, set_char) in [
            (Class::Owner, self.setuid(), 's'),
            (Class::Group, self.setgid(), 's'),
            (Class::Other, self.sticky(), 't'),
        ] {
            let access = self.access(class);
            out.push(if access.read { 'r' } else { '-' });
            out.push(if access.write { 'w' } else { '-' });
            out.push(match (access.execute, special) {
                (true, true) => set_char,
                (false, true) => set_char.to_ascii_uppercase(),
                (true, false) => 'x',
                (false, false) => '-',
            });
        }
        out
    }

    /// Octal form: three digits, or four when any special bit is set.
    pub fn to_octal(self) -> String {
        if self.0 & !0o777 != 0 {
            format!("{:04o}", self.0)
        } else {
            format!("{:03o}", self.0)
        }
    }

    /// Parse the symbolic form. Accepts the bare nine characters or the
    /// ten-character `ls -l` form whose leading file-type column is ignored.
    pub fn parse_symbolic(s: &str) -> Result<Self> {
        let chars: Vec<char> = s.chars().collect();
        let body = match chars.len() {
            9 => &chars[..],
            10 if "-dlcbps".contains(chars[0]) => &chars[1..],
            _ => return Err(invalid(s)),
        };

        let mut bits = 0u16;
        for (i, triad) in body.chunks(3).enumerate() {
            let shift = 6 - 3 * i as u16;
            let (special_bit, lower, upper) = match i {
                0 => (SETUID, 's', 'S'),
                1 => (SETGID, 's', 'S'),
                _ => (STICKY, 't', 'T'),
            };
            match triad[0] {
                'r' => bits |= 0o4 << shift,
                '-' => {}
                _ => return Err(invalid(s)),
            }
            match triad[1] {
                'w' => bits |= 0o2 << shift,
                '-' => {}
                _ => return Err(invalid(s)),
            }
            match triad[2] {
                'x' => bits |= 0o1 << shift,
                '-' => {}
                c if c == lower => bits |= (0o1 << shift) | special_bit,
                c if c == upper => bits |= special_bit,
                _ => return Err(invalid(s)),
            }
        }
        Ok(Self(bits))
    }

    /// Parse 3 or 4 octal digits (`755`, `0644`, `4755`).
    pub fn parse_octal(s: &str) -> Result<Self> {
        if !(3..=4).contains(&s.len()) || !s.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
            return Err(invalid(s));
        }
        u16::from_str_radix(s, 8)
            .map(Self)
            .map_err(|_| invalid(s))
    }
}

fn invalid(s: &str) -> Error {
    Error::InvalidConfig(format!("invalid permission string {:?}", s))
}

impl FromStr for PermissionSet {
    type Err = Error;

    /// Digits parse as octal, anything else as symbolic.
    fn from_str(s: &str) -> Result<Self> {
        if s.bytes().all(|b| b.is_ascii_digit()) {
            Self::parse_octal(s)
        } else {
            Self::parse_symbolic(s)
        }
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_symbolic())
    }
}

impl TryFrom<String> for PermissionSet {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PermissionSet> for String {
    fn from(p: PermissionSet) -> Self {
        p.to_octal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbolic_format() {
        assert_eq!(PermissionSet::from_mode(0o755).to_symbolic(), "rwxr-xr-x");
        assert_eq!(PermissionSet::from_mode(0o644).to_symbolic(), "rw-r--r--");
        assert_eq!(PermissionSet::from_mode(0o4755).to_symbolic(), "rwsr-xr-x");
        assert_eq!(PermissionSet::from_mode(0o2745).to_symbolic(), "rwxr-Sr-x");
        assert_eq!(PermissionSet::from_mode(0o1777).to_symbolic(), "rwxrwxrwt");
        assert_eq!(PermissionSet::from_mode(0o1776).to_symbolic(), "rwxrwxrwT");
    }

    #[test]
    fn test_octal_format() {
        assert_eq!(PermissionSet::from_mode(0o755).to_octal(), "755");
        assert_eq!(PermissionSet::from_mode(0o7).to_octal(), "007");
        assert_eq!(PermissionSet::from_mode(0o4755).to_octal(), "4755");
    }

    #[test]
    fn test_from_mode_drops_file_type() {
        // S_IFDIR | 0755
        assert_eq!(PermissionSet::from_mode(0o40755).mode(), 0o755);
    }

    #[test]
    fn test_parse_listing_form() {
        let p = PermissionSet::parse_symbolic("drwxr-xr-x").unwrap();
        assert_eq!(p.mode(), 0o755);
        let p = PermissionSet::parse_symbolic("-rwsr-sr-t").unwrap();
        assert_eq!(p.mode(), 0o7755);
        assert!(PermissionSet::parse_symbolic("xrwxr-xr-x").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(PermissionSet::parse_symbolic("rwxr-xr-").is_err());
        assert!(PermissionSet::parse_symbolic("rwxr-xr-s").is_err());
        assert!(PermissionSet::parse_symbolic("wrxr-xr-x").is_err());
        assert!(PermissionSet::parse_octal("75").is_err());
        assert!(PermissionSet::parse_octal("758").is_err());
        assert!(PermissionSet::parse_octal("17555").is_err());
    }

    #[test]
    fn test_round_trip_every_value() {
        for bits in 0..=0o7777u32 {
            let p = PermissionSet::from_mode(bits);
            assert_eq!(PermissionSet::parse_symbolic(&p.to_symbolic()).unwrap(), p);
            assert_eq!(PermissionSet::parse_octal(&p.to_octal()).unwrap(), p);
        }
    }

    #[test]
    fn test_access_editing() {
        let p = PermissionSet::from_mode(0o644).with_access(
            Class::Owner,
            Access {
                read: true,
                write: true,
                execute: true,
            },
        );
        assert_eq!(p.to_octal(), "744");
        assert!(p.access(Class::Group).read);
        assert!(!p.access(Class::Other).write);

        let p = p.with_special(false, true, false);
        assert_eq!(p.to_octal(), "2744");
        assert_eq!(p.with_special(false, false, false).to_octal(), "744");
    }

    #[test]
    fn test_from_str_dispatch() {
        assert_eq!("0750".parse::<PermissionSet>().unwrap().mode(), 0o750);
        assert_eq!("rwxr-x---".parse::<PermissionSet>().unwrap().mode(), 0o750);
    }
}

//! Controller ini-setting queries. Type 'i'.

use crate::codec;

/// Entry type tag for boolean settings.
pub const ENTRY_BOOL: u8 = b'b';

/// Setting that reports whether the controller runs in IF mode.
pub const IFMODE_SETTING: &str = "site_settings:ifmode";

/// `QUERY_INI_SETTINGS` payload: `len:i32 name[len] (NUL-terminated) type:u8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniQuery {
    pub name: String,
    pub entry_type: u8,
}

impl IniQuery {
    pub fn boolean(name: &str) -> Self {
        Self { name: name.to_string(), entry_type: ENTRY_BOOL }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.name.len() + 6);
        codec::write_cstring(&mut buf, &self.name);
        buf.push(self.entry_type);
        buf
    }
}

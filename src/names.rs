//! Validation of object paths, interface, member, error and bus names.
//!
//! Every name is checked against the wire grammar before it is used in a
//! registration or put into an outgoing message; a malformed name fails
//! with [`Error::InvalidName`] instead of being sent to a peer.

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 255;

fn is_element_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_element_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// Dotted-name check shared by interface, error and well-known bus names.
///
/// `allow_dash` admits `-` inside elements (bus names only); `digit_start`
/// admits elements starting with a digit (unique bus names only).
fn is_valid_dotted(name: &str, allow_dash: bool, digit_start: bool) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut elements = 0;
    for element in name.split('.') {
        let bytes = element.as_bytes();
        if bytes.is_empty() {
            return false;
        }
        let first_ok = is_element_start(bytes[0])
            || (digit_start && bytes[0].is_ascii_digit())
            || (allow_dash && bytes[0] == b'-');
        if !first_ok {
            return false;
        }
        for &c in &bytes[1..] {
            if !(is_element_char(c) || (allow_dash && c == b'-')) {
                return false;
            }
        }
        elements += 1;
    }
    elements >= 2
}

/// Interface names: two or more dot-separated elements, each
/// `[A-Za-z_][A-Za-z0-9_]*`, at most 255 bytes in total.
pub fn is_valid_interface_name(name: &str) -> bool {
    is_valid_dotted(name, false, false)
}

/// Error names follow the interface-name grammar.
pub fn is_valid_error_name(name: &str) -> bool {
    is_valid_interface_name(name)
}

/// Member (method, signal, property) names: a single element,
/// `[A-Za-z_][A-Za-z0-9_]*`, no dots, at most 255 bytes.
pub fn is_valid_member_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let bytes = name.as_bytes();
    is_element_start(bytes[0]) && bytes[1..].iter().all(|&c| is_element_char(c))
}

/// Bus names: either a unique name (`:` followed by dotted elements that may
/// start with digits) or a well-known name (interface grammar plus `-`).
pub fn is_valid_bus_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LEN {
        return false;
    }
    if let Some(rest) = name.strip_prefix(':') {
        is_valid_dotted(rest, true, true)
    } else {
        is_valid_dotted(name, true, false)
    }
}

/// Object paths: `/`, or `/`-separated non-empty elements of
/// `[A-Za-z0-9_]`, with no trailing slash.
pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    if rest.is_empty() || rest.ends_with('/') {
        return false;
    }
    rest.split('/')
        .all(|el| !el.is_empty() && el.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'_'))
}

pub fn ensure_interface_name(name: &str) -> Result<()> {
    if is_valid_interface_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(format!("bad interface name '{}'", name)))
    }
}

pub fn ensure_member_name(name: &str) -> Result<()> {
    if is_valid_member_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(format!("bad member name '{}'", name)))
    }
}

pub fn ensure_error_name(name: &str) -> Result<()> {
    if is_valid_error_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(format!("bad error name '{}'", name)))
    }
}

pub fn ensure_bus_name(name: &str) -> Result<()> {
    if is_valid_bus_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(format!("bad bus name '{}'", name)))
    }
}

pub fn ensure_object_path(path: &str) -> Result<()> {
    if is_valid_object_path(path) {
        Ok(())
    } else {
        Err(Error::InvalidName(format!("bad object path '{}'", path)))
    }
}

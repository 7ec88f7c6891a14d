use thiserror::Error;

use crate::amiga::dos_error;

/// Host-side error taxonomy. AmigaDOS error numbers stay values inside the
/// bridge (`Packet`); everything else is a host-level failure.
#[derive(Debug, Error)]
pub enum AmiError {
    #[error("image error: {0}")]
    Image(String),

    #[error("handler load error: {0}")]
    HandlerLoad(String),

    #[error("handler boot failed: {0}")]
    HandlerBoot(String),

    #[error("packet timed out (cycle budget exhausted)")]
    PacketTimeout,

    #[error("handler returned AmigaDOS error {0}")]
    Packet(i32),

    #[error("bus error: access at {addr:#010x} (pc {pc:#010x})")]
    Bus { addr: u32, pc: u32 },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<crate::mem::BusFault> for AmiError {
    fn from(f: crate::mem::BusFault) -> Self {
        AmiError::Bus {
            addr: f.addr,
            pc: 0,
        }
    }
}

impl AmiError {
    /// True for errors that require tearing the mount down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AmiError::Bus { .. } | AmiError::Protocol(_))
    }

    /// Map to a POSIX errno for the FUSE boundary.
    ///
    /// `ERROR_NO_MORE_ENTRIES` never reaches this function; the bridge's
    /// directory iteration consumes it as end-of-listing.
    pub fn errno(&self) -> i32 {
        match self {
            AmiError::Packet(code) => dos_error_to_errno(*code),
            AmiError::PacketTimeout => libc::EIO,
            AmiError::Io(_) => libc::EIO,
            _ => libc::EIO,
        }
    }
}

pub fn dos_error_to_errno(code: i32) -> i32 {
    match code as u32 {
        dos_error::OBJECT_NOT_FOUND | dos_error::DIR_NOT_FOUND => libc::ENOENT,
        dos_error::OBJECT_IN_USE => libc::EBUSY,
        dos_error::OBJECT_WRONG_TYPE => libc::ENOTDIR,
        // Modification denied, whether by the medium or the object.
        dos_error::DISK_WRITE_PROTECTED
        | dos_error::DELETE_PROTECTED
        | dos_error::WRITE_PROTECTED => libc::EROFS,
        dos_error::READ_PROTECTED => libc::EACCES,
        dos_error::NO_FREE_STORE => libc::ENOMEM,
        dos_error::INVALID_COMPONENT_NAME => libc::EINVAL,
        _ => libc::EIO,
    }
}

pub type Result<T> = std::result::Result<T, AmiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_enoent() {
        assert_eq!(AmiError::Packet(205).errno(), libc::ENOENT);
        assert_eq!(AmiError::Packet(204).errno(), libc::ENOENT);
    }

    #[test]
    fn in_use_maps_to_ebusy() {
        assert_eq!(AmiError::Packet(202).errno(), libc::EBUSY);
    }

    #[test]
    fn protection_errors_map_to_erofs_and_eacces() {
        // 214 ERROR_DISK_WRITE_PROTECTED, 222 ERROR_DELETE_PROTECTED,
        // 223 ERROR_WRITE_PROTECTED all deny modification.
        assert_eq!(AmiError::Packet(214).errno(), libc::EROFS);
        assert_eq!(AmiError::Packet(222).errno(), libc::EROFS);
        assert_eq!(AmiError::Packet(223).errno(), libc::EROFS);
        // 224 ERROR_READ_PROTECTED denies access, not writability.
        assert_eq!(AmiError::Packet(224).errno(), libc::EACCES);
    }

    #[test]
    fn unknown_codes_fall_back_to_eio() {
        assert_eq!(AmiError::Packet(999).errno(), libc::EIO);
        assert_eq!(AmiError::PacketTimeout.errno(), libc::EIO);
    }
}

//! Target description.
//!
//! The backend only generates code for AArch64, but the operating system
//! still matters: Darwin uses its own variant of the AAPCS64 parameter
//! passing rules, and the linker flavor decides how callee addresses are
//! materialized.

/// Operating system the generated code is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Macos,
    Windows,
    Plan9,
}

/// The compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub os: Os,
}

impl Target {
    pub fn new(os: Os) -> Self {
        Self { os }
    }

    /// Whether the Apple variant of the AAPCS64 applies.
    pub fn is_darwin(&self) -> bool {
        self.os == Os::Macos
    }
}

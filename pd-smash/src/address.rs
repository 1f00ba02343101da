/// An address inside a code buffer.
///
/// Used both for where a sequence begins and for where a branch lands. The
/// value carries no ownership; it stays meaningful while the buffer it
/// points into is mapped.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CodeAddress(usize);

impl CodeAddress {
    pub const NULL: CodeAddress = CodeAddress(0);

    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `align` must be a power of two.
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Byte distance from `origin` to `self`, or `None` when `self` lies below it.
    pub const fn distance_from(self, origin: CodeAddress) -> Option<usize> {
        self.0.checked_sub(origin.0)
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }

    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl From<usize> for CodeAddress {
    fn from(raw: usize) -> Self {
        Self(raw)
    }
}

impl std::fmt::Debug for CodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CodeAddress({:#x})", self.0)
    }
}

impl std::fmt::Display for CodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl std::fmt::LowerHex for CodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_and_distance_follow_raw_value() {
        let addr = CodeAddress::new(0x1004);
        assert!(addr.is_aligned(4));
        assert!(!addr.is_aligned(8));
        assert!(addr.add(4).is_aligned(8));
        assert_eq!(addr.distance_from(CodeAddress::new(0x1000)), Some(4));
        assert_eq!(CodeAddress::new(0x1000).distance_from(addr), None);
    }

    #[test]
    fn formats_as_hex() {
        let addr = CodeAddress::new(0x3000);
        assert_eq!(addr.to_string(), "0x3000");
        assert_eq!(format!("{addr:?}"), "CodeAddress(0x3000)");
        assert_eq!(format!("{addr:x}"), "3000");
        assert!(CodeAddress::NULL.is_null());
    }
}

//! Hidden pointers
//!
//! Registry tables and debug back-pointer slots store object addresses in a
//! transformed form so that a conservative scan of their storage does not
//! mistake them for strong references. The transform XORs the address with a
//! fixed byte pattern and swaps the two halves of the word, which moves every
//! plausible heap address far outside the heap.

use std::fmt;

/// Byte pattern XORed into every hidden address.
const HIDE_MASK: usize = usize::from_ne_bytes([0xA5; std::mem::size_of::<usize>()]);

/// Rotation applied after masking.
const HIDE_ROTATION: u32 = usize::BITS / 2;

/// An object address that is deliberately not a traceable pointer.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HiddenPointer(usize);

impl HiddenPointer {
    /// Back-pointer slot value for an object that was never reached.
    pub const NOT_MARKED: HiddenPointer = HiddenPointer::hide(0);

    /// Back-pointer slot value for an object first reached while marking
    /// through a finalizable object.
    pub const MARKED_FOR_FINALIZATION: HiddenPointer = HiddenPointer::hide(2);

    /// Hide an address.
    #[inline]
    pub const fn hide(addr: usize) -> Self {
        HiddenPointer((addr ^ HIDE_MASK).rotate_left(HIDE_ROTATION))
    }

    /// Recover the address this value was built from.
    #[inline]
    pub const fn reveal(self) -> usize {
        self.0.rotate_right(HIDE_ROTATION) ^ HIDE_MASK
    }

    /// Raw stored bits, as written into header words.
    #[inline]
    pub const fn to_bits(self) -> usize {
        self.0
    }

    /// Reinterpret raw header bits as a hidden pointer.
    #[inline]
    pub const fn from_bits(bits: usize) -> Self {
        HiddenPointer(bits)
    }
}

impl fmt::Debug for HiddenPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HiddenPointer({:#x})", self.reveal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hidden_value_is_not_the_address() {
        let addr = 0x7f00_1234_5670usize;
        let hidden = HiddenPointer::hide(addr);
        assert_ne!(hidden.to_bits(), addr);
        assert_eq!(hidden.reveal(), addr);
    }

    #[test]
    fn test_sentinels_are_distinct() {
        assert_ne!(HiddenPointer::NOT_MARKED, HiddenPointer::MARKED_FOR_FINALIZATION);
        assert_eq!(HiddenPointer::NOT_MARKED.reveal(), 0);
        assert_eq!(HiddenPointer::MARKED_FOR_FINALIZATION.reveal(), 2);
    }

    proptest! {
        #[test]
        fn prop_reveal_inverts_hide(addr in any::<usize>()) {
            prop_assert_eq!(HiddenPointer::hide(addr).reveal(), addr);
            let bits = HiddenPointer::hide(addr).to_bits();
            prop_assert_eq!(HiddenPointer::from_bits(bits).reveal(), addr);
        }
    }
}

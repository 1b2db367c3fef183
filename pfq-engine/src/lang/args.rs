//! Typed argument slots for functional nodes.
//!
//! The wire format erases argument types into 8-byte values plus an
//! out-of-line escape for arrays and oversized scalars. Engine-side, each
//! slot owns its bytes and exposes size-checked accessors parameterised
//! over `Pod` types, so reinterpretation stays confined to `bytemuck`
//! casts validated against the symbol's declared signature at submission.

use bytemuck::Pod;
use pfq_common::ARG_INLINE_MAX;

/// One erased argument slot. `nelem == 0` marks a scalar; `nelem > 0` an
/// array of `nelem` elements.
#[derive(Clone, Debug, Default)]
pub struct ArgSlot {
    data: Box<[u8]>,
    nelem: usize,
}

impl ArgSlot {
    pub fn empty() -> Self {
        ArgSlot::default()
    }

    /// Build a scalar slot from a `Pod` value.
    pub fn scalar<T: Pod>(value: T) -> Self {
        ArgSlot {
            data: bytemuck::bytes_of(&value).to_vec().into_boxed_slice(),
            nelem: 0,
        }
    }

    /// Build an array slot from a `Pod` slice.
    pub fn array<T: Pod>(values: &[T]) -> Self {
        ArgSlot {
            data: bytemuck::cast_slice(values).to_vec().into_boxed_slice(),
            nelem: values.len(),
        }
    }

    /// Raw-bytes constructor used when decoding submissions.
    pub fn from_bytes(data: Vec<u8>, nelem: usize) -> Self {
        ArgSlot {
            data: data.into_boxed_slice(),
            nelem,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element count: 0 for scalars.
    pub fn nelem(&self) -> usize {
        self.nelem
    }

    /// Byte size of the stored value.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Whether the scalar payload fits the inline-slot bound of the wire
    /// format.
    pub fn fits_inline(&self) -> bool {
        self.nelem > 0 || self.data.len() <= ARG_INLINE_MAX
    }

    /// Read the slot as a scalar of type `T`. Shorter stored values are
    /// zero-extended; the submission validator guarantees exact sizes for
    /// compiled computations.
    pub fn get<T: Pod>(&self) -> T {
        let mut value = T::zeroed();
        let dst = bytemuck::bytes_of_mut(&mut value);
        let n = dst.len().min(self.data.len());
        dst[..n].copy_from_slice(&self.data[..n]);
        value
    }

    /// View the slot as a slice of `T`. Returns an empty slice when the
    /// stored bytes do not divide evenly into `T`s.
    pub fn slice<T: Pod>(&self) -> &[T] {
        bytemuck::try_cast_slice(&self.data).unwrap_or(&[])
    }

    /// Replace the slot contents. Used by node `init` hooks that build
    /// derived state (e.g. a bloom bitset) into a spare slot.
    pub fn store_bytes(&mut self, data: Vec<u8>, nelem: usize) {
        self.data = data.into_boxed_slice();
        self.nelem = nelem;
    }
}

/// Declared shape of one signature position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgSig {
    /// A scalar of exactly this many bytes.
    Scalar(usize),
    /// An array with elements of this many bytes.
    Array(usize),
}

impl ArgSig {
    /// Check a submitted slot against this signature position.
    pub fn admits(&self, slot: &ArgSlot) -> bool {
        match *self {
            ArgSig::Scalar(size) => slot.nelem() == 0 && slot.size() == size,
            ArgSig::Array(elem) => {
                slot.nelem() > 0 && slot.size() == slot.nelem() * elem
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip() {
        let slot = ArgSlot::scalar(0xdead_beefu32);
        assert_eq!(slot.nelem(), 0);
        assert_eq!(slot.size(), 4);
        assert_eq!(slot.get::<u32>(), 0xdead_beef);
    }

    #[test]
    fn small_scalar_zero_extends() {
        let slot = ArgSlot::scalar(7u16);
        assert_eq!(slot.get::<u64>(), 7);
    }

    #[test]
    fn array_roundtrip() {
        let slot = ArgSlot::array(&[1u16, 2, 3]);
        assert_eq!(slot.nelem(), 3);
        assert_eq!(slot.slice::<u16>(), &[1, 2, 3]);
    }

    #[test]
    fn misaligned_slice_is_empty() {
        let slot = ArgSlot::from_bytes(vec![1, 2, 3], 3);
        assert!(slot.slice::<u16>().is_empty());
    }

    #[test]
    fn signature_admission() {
        assert!(ArgSig::Scalar(4).admits(&ArgSlot::scalar(1u32)));
        assert!(!ArgSig::Scalar(4).admits(&ArgSlot::scalar(1u64)));
        assert!(!ArgSig::Scalar(4).admits(&ArgSlot::array(&[1u32])));
        assert!(ArgSig::Array(2).admits(&ArgSlot::array(&[1u16, 2])));
        assert!(!ArgSig::Array(2).admits(&ArgSlot::scalar(1u16)));
    }

    #[test]
    fn inline_bound() {
        assert!(ArgSlot::scalar([0u8; 64]).fits_inline());
        assert!(!ArgSlot::scalar([0u8; 65]).fits_inline());
        assert!(ArgSlot::array(&[0u64; 32]).fits_inline());
    }
}

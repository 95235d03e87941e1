//! Keys, keyed records and key references.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Fixed-width unsigned integer that can be used as a radix sort key.
pub trait Key: Copy + Ord + Debug + Send + Sync + 'static {
    /// Key width in bits.
    const BITS: u32;
    /// The smallest key value.
    const ZERO: Self;

    /// Returns the bucket index `(self - offset) >> shift`.
    /// A shift by the key width or more yields bucket `0`.
    fn bucket_index(self, offset: Self, shift: u32) -> usize;

    /// Returns the first key of bucket `index` for buckets of width `2^shift` starting at `self`.
    fn bucket_base(self, shift: u32, index: usize) -> Self;
}

macro_rules! impl_key {
    ($($t:ty),*) => {
        $(
            impl Key for $t {
                const BITS: u32 = <$t>::BITS;
                const ZERO: Self = 0;

                #[inline]
                fn bucket_index(self, offset: Self, shift: u32) -> usize {
                    self.wrapping_sub(offset).checked_shr(shift).unwrap_or(0) as usize
                }

                #[inline]
                fn bucket_base(self, shift: u32, index: usize) -> Self {
                    let step = (index as $t).checked_shl(shift).unwrap_or(0);
                    self.wrapping_add(step)
                }
            }

            impl Keyed for $t {
                type Key = $t;

                #[inline]
                fn key(&self) -> Self::Key {
                    *self
                }
            }
        )*
    };
}

/// Type exposing a fixed-width unsigned key.
pub trait Keyed {
    type Key: Key;

    /// Returns the record key.
    fn key(&self) -> Self::Key;
}

impl_key!(u8, u16, u32, u64, usize);

/// Pairs are keyed by their first field.
impl<K: Key, V> Keyed for (K, V) {
    type Key = K;

    #[inline]
    fn key(&self) -> Self::Key {
        self.0
    }
}

/// Record that can be stored in external blocks and sorted by key.
pub trait Record: Keyed + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Record for T where T: Keyed + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Key reference: a record key together with a reference to the record itself.
/// Radix passes move key references only, records stay where they were loaded.
pub struct KeyRef<'a, T: Keyed> {
    pub key: T::Key,
    pub record: &'a T,
}

impl<'a, T: Keyed> KeyRef<'a, T> {
    #[inline]
    pub fn new(record: &'a T) -> Self {
        KeyRef {
            key: record.key(),
            record,
        }
    }
}

impl<'a, T: Keyed> Clone for KeyRef<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T: Keyed> Copy for KeyRef<'a, T> {}

impl<'a, T: Keyed> Debug for KeyRef<'a, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRef").field("key", &self.key).finish()
    }
}

/// Derives `std::hash::Hash` and the hex conversions of a type from its
/// `ToBytes` and `FromBytes` implementations.
#[macro_export]
macro_rules! impl_associate_bytes_types {
    ($type:ty) => {
        impl std::hash::Hash for $type {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                std::hash::Hash::hash(&$crate::prelude::ToBytes::to_bytes(self), state);
            }
        }

        impl $crate::prelude::FromHex for $type {
            fn from_hex(input: &str) -> $crate::prelude::Result<Self> {
                let bytes = hex::decode(input)?;
                <Self as $crate::prelude::FromBytes>::from_bytes(&bytes)
            }
        }

        impl $crate::prelude::ToHex for $type {
            fn to_hex(&self) -> String {
                hex::encode($crate::prelude::ToBytes::to_bytes(self))
            }
        }
    };
}

mod error;

pub mod bitfield;
pub mod block_store;
pub mod cipher;
pub mod codec;
pub mod config;
pub mod core;
pub mod flat_tree;
pub mod hash;
pub mod mutex;
pub mod oplog;
pub mod prelude;
pub mod replicator;
pub mod storage;
pub mod testing;
pub mod tree;
pub mod verifier;

pub use crate::{
    config::{CoreOptions, ReplicatorOptions},
    core::{Core, CoreEvent, CoreHandles, Session},
    replicator::Replicator,
};

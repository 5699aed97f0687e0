use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityIndex(usize);
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceIndex(usize);
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimitiveIndex(usize);
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileIndex(usize);

macro_rules! idx_impl {
    ($($t:ty),*) => {
        $(
            impl From<usize> for $t {
                fn from(idx: usize) -> Self {
                    Self(idx)
                }
            }

            impl From<$t> for usize {
                fn from(idx: $t) -> Self {
                    idx.0
                }
            }

            impl fmt::Debug for $t {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    self.0.fmt(f)
                }
            }
        )*
    };
}

idx_impl! {
    EntityIndex,
    InstanceIndex,
    PrimitiveIndex,
    TileIndex
}

pub trait ConfigType {
    fn default() -> Self;
}

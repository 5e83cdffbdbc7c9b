//! Utility items shared by the kernel modules.
use core::{
    cell::{Cell, UnsafeCell},
    marker::PhantomData,
    mem,
};

mod aligned;
pub use self::aligned::AlignedStackStorage;

/// Trait for types with a constant default value — a `const` version of
/// `Default`, used to build kernel structures in statics.
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: ?Sized> Init for PhantomData<T> {
    const INIT: Self = PhantomData;
}

impl<T: Init> Init for UnsafeCell<T> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = UnsafeCell::new(T::INIT);
}

impl<T: Init> Init for Cell<T> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Cell::new(T::INIT);
}

impl<T: Init, I: Init> Init for tokenlock::TokenLock<T, I> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<T: Init, I: Init> Init for tokenlock::UnsyncTokenLock<T, I> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<Tag: ?Sized> Init for tokenlock::SingletonTokenId<Tag> {
    const INIT: Self = Self::new();
}

impl<T, const N: usize> Init for arrayvec::ArrayVec<T, N> {
    const INIT: Self = Self::new_const();
}

impl<T> Init for mem::MaybeUninit<T> {
    const INIT: Self = mem::MaybeUninit::uninit();
}

macro_rules! impl_init {
    ( $( $ty:ty => $value:expr, )* ) => {
        $(
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    usize => 0,
    i8 => 0,
    i32 => 0,
    () => (),
}

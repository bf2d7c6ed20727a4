/// Provides a constant default value.
///
/// Pools, registries and their option structs are typically placed in
/// `static`s on the target, so their defaults must be usable in constant
/// context.
pub trait Init {
    /// `Self`'s default value.
    const INIT: Self;
}

/// Implement a "C-like" enum that also keeps a catch-all variant for values
/// that do not map to one of the defined constants.
///
/// Wire-format fields (ARP opcodes, IP protocol numbers, ...) are a small
/// closed set of values in practice but an open set on the wire: a malformed
/// or future peer can send anything. The `Unknown` variant lets callers match
/// on the interesting cases without a parse failure for the rest.
macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident($ty:ty) {
            $( $( #[$variant_attr:meta] )* $variant:ident = $value:expr ),+ $(,)?
        }
    ) => {
        $( #[$enum_attr] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $( $( #[$variant_attr] )* $variant ),+,
            Unknown($ty),
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant ),+,
                    other => $name::Unknown(other),
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value ),+,
                    $name::Unknown(other) => other,
                }
            }
        }
    };
}

//! Declarative helpers for the many small wire-level identifier tables.

/// Defines a fieldless enum backed by a raw integer, with conversions in
/// both directions.
///
/// An optional `default = Variant` clause adds a [`Default`] impl and a
/// lenient `from_raw_or_default` constructor for values reported by
/// firmware that may fall outside the known set.
macro_rules! define_id_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $repr:ty $(, default = $default:ident)? {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr($repr)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            /// All known variants, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn from_raw(value: $repr) -> Option<Self> {
                match value {
                    $( v if v == $value => Some($name::$variant), )+
                    _ => None,
                }
            }

            pub fn raw(self) -> $repr {
                self as $repr
            }
        }

        impl TryFrom<$repr> for $name {
            type Error = $repr;

            fn try_from(value: $repr) -> std::result::Result<Self, $repr> {
                Self::from_raw(value).ok_or(value)
            }
        }

        $(
            impl Default for $name {
                fn default() -> Self {
                    $name::$default
                }
            }

            impl $name {
                pub fn from_raw_or_default(value: $repr) -> Self {
                    Self::from_raw(value).unwrap_or_else(|| {
                        log::debug!(
                            "Unknown {} value {:#x}, using {:?}",
                            stringify!($name),
                            value,
                            $name::$default
                        );
                        $name::$default
                    })
                }
            }
        )?
    };
}

/// Defines numeric error codes together with a lookup for their messages.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:literal),+ $(,)?) => {
        $(
            #[doc = $msg]
            pub const $name: u32 = $code;
        )+

        /// Returns the human readable message for an error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $( $code => $msg, )+
                _ => "Unknown error",
            }
        }
    };
}

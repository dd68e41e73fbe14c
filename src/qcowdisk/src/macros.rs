//! Helper macros.

/// Declares a fieldless enum with fixed on-disk values.
///
/// `TryFrom<repr>` hands unknown values back unchanged as the error; whether an unknown value is
/// fatal is up to the caller.  `From<enum>` yields the raw value.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident: $repr:ty {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident = $raw:expr,
            )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant,
            )+
        }

        impl From<$name> for $repr {
            fn from(value: $name) -> $repr {
                match value {
                    $($name::$variant => $raw,)+
                }
            }
        }

        impl TryFrom<$repr> for $name {
            type Error = $repr;

            fn try_from(raw: $repr) -> ::std::result::Result<Self, $repr> {
                [$($name::$variant),+]
                    .into_iter()
                    .find(|known| <$repr>::from(*known) == raw)
                    .ok_or(raw)
            }
        }
    };
}

pub(crate) use wire_enum;

#[cfg(test)]
mod tests {
    // Generated code must work next to a single-parameter `Result` alias
    #[allow(unused_imports)]
    use crate::error::Result;

    wire_enum! {
        enum Colour: u8 {
            Red = 1,
            Green = 2,
        }
    }

    #[test]
    fn known_values_convert_both_ways() {
        assert_eq!(Colour::try_from(2), Ok(Colour::Green));
        assert_eq!(Colour::try_from(1), Ok(Colour::Red));
        assert_eq!(u8::from(Colour::Green), 2);
        assert_eq!(Colour::try_from(7), Err(7));
    }
}

/// Define a transparent newtype over a raw wire representation with named
/// constants for the values defined by the protocol.
///
/// Unlike a Rust `enum`, unknown values coming off the wire stay
/// representable and are rejected where it matters instead of at decode.
macro_rules! raw_enum {
    (
        #[repr($repr:ty)]
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident = $value:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        $vis struct $name(pub(crate) $repr);

        impl $name {
            $(
                $(#[$variant_meta])*
                $vis const $variant: Self = Self($value);
            )*
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match *self {
                    $(Self::$variant => f.write_str(stringify!($variant)),)*
                    _ => write!(f, "UNKNOWN({})", self.0),
                }
            }
        }
    };
}

/// Like [`raw_enum!`], but for bit sets. Generates the set operations so
/// that `a | b` combines and `a & b` tests membership.
macro_rules! raw_set {
    (
        #[repr($repr:ty)]
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident = $value:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Default, Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        $vis struct $name(pub(crate) $repr);

        impl $name {
            $(
                $(#[$variant_meta])*
                $vis const $variant: Self = Self($value);
            )*
        }

        impl core::ops::BitOr for $name {
            type Output = Self;

            #[inline]
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl core::ops::BitOrAssign for $name {
            #[inline]
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl core::ops::BitAnd for $name {
            type Output = bool;

            #[inline]
            fn bitand(self, rhs: Self) -> bool {
                self.0 & rhs.0 != 0
            }
        }

        impl core::ops::BitXor for $name {
            type Output = Self;

            #[inline]
            fn bitxor(self, rhs: Self) -> Self {
                Self(self.0 ^ rhs.0)
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                let mut f = f.debug_set();
                let mut this = *self;

                $(
                    if $value != 0 && this & Self::$variant {
                        f.entry(&format_args!("{}", stringify!($variant)));
                        this = this ^ Self::$variant;
                    }
                )*

                if this.0 != 0 {
                    f.entry(&format_args!("{:b}", this.0));
                }

                f.finish()
            }
        }
    };
}

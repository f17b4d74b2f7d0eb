//! Bit-set newtypes for hook capabilities, fence scopes and buffer modes

/// Declare a `u32` bit-set newtype with named single-bit constants.
///
/// ```rust,ignore
/// flag_set! {
///     /// Host mapping mode
///     pub struct MapFlags {
///         const READ = 1 << 0;
///         const WRITE = 1 << 1;
///     }
/// }
/// ```
macro_rules! flag_set {
    (
        $(#[$outer:meta])*
        pub struct $name:ident {
            $(
                $(#[$inner:meta])*
                const $flag:ident = $value:expr;
            )+
        }
    ) => {
        $(#[$outer])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $(
                $(#[$inner])*
                pub const $flag: Self = Self($value);
            )+

            const NAMED: &'static [(&'static str, Self)] = &[$((stringify!($flag), Self::$flag)),+];

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn all() -> Self {
                Self(0 $(| $value)+)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            /// Keep only the bits that name a flag.
            pub const fn from_bits_truncate(bits: u32) -> Self {
                Self(bits & Self::all().0)
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            /// Each set flag on its own, lowest bit first.
            pub fn iter(self) -> impl Iterator<Item = Self> {
                Self::NAMED
                    .iter()
                    .map(|(_, flag)| *flag)
                    .filter(move |flag| self.contains(*flag))
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let names: Vec<&str> = Self::NAMED
                    .iter()
                    .filter(|(_, flag)| self.contains(*flag))
                    .map(|(name, _)| *name)
                    .collect();
                if names.is_empty() {
                    write!(f, "{}(empty)", stringify!($name))
                } else {
                    write!(f, "{}({})", stringify!($name), names.join(" | "))
                }
            }
        }
    };
}

pub(crate) use flag_set;

#[cfg(test)]
mod tests {
    flag_set! {
        pub struct Sample {
            const A = 1 << 0;
            const B = 1 << 1;
            const C = 1 << 4;
        }
    }

    #[test]
    fn test_set_operations() {
        let ab = Sample::A | Sample::B;
        assert!(ab.contains(Sample::A));
        assert!(!ab.contains(Sample::A | Sample::C));
        assert!(ab.intersects(Sample::B | Sample::C));
        assert!(Sample::empty().is_empty());
        assert_eq!(Sample::all().bits(), 0b1_0011);
        assert_eq!((ab & Sample::B), Sample::B);
    }

    #[test]
    fn test_truncate_drops_unknown_bits() {
        assert_eq!(Sample::from_bits_truncate(0b1111), Sample::A | Sample::B);
    }

    #[test]
    fn test_iter_lowest_first() {
        let set = Sample::C | Sample::A;
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Sample::A, Sample::C]);
    }

    #[test]
    fn test_debug_lists_names() {
        assert_eq!(format!("{:?}", Sample::A | Sample::C), "Sample(A | C)");
        assert_eq!(format!("{:?}", Sample::empty()), "Sample(empty)");
    }
}

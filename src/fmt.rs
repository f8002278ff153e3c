//! Logging shims.
//!
//! The crate logs through whichever backend is enabled: `defmt`, `log` or
//! `esp-println` (feature `esp32-log`). With none of them enabled the macros
//! only borrow their arguments so that no "unused variable" warnings leak into
//! call sites.

#![allow(unused_macros)]

macro_rules! trace {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::trace!($s $(, $x)*);
        #[cfg(feature = "log")]
        ::log::trace!($s $(, $x)*);
        #[cfg(not(any(feature = "defmt", feature = "log")))]
        { $( let _ = &$x; )* }
    }};
}

macro_rules! debug {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::debug!($s $(, $x)*);
        #[cfg(feature = "log")]
        ::log::debug!($s $(, $x)*);
        #[cfg(feature = "esp32-log")]
        ::esp_println::println!($s $(, $x)*);
        #[cfg(not(any(feature = "defmt", feature = "log", feature = "esp32-log")))]
        { $( let _ = &$x; )* }
    }};
}

macro_rules! info {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::info!($s $(, $x)*);
        #[cfg(feature = "log")]
        ::log::info!($s $(, $x)*);
        #[cfg(feature = "esp32-log")]
        ::esp_println::println!($s $(, $x)*);
        #[cfg(not(any(feature = "defmt", feature = "log", feature = "esp32-log")))]
        { $( let _ = &$x; )* }
    }};
}

macro_rules! warn {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::warn!($s $(, $x)*);
        #[cfg(feature = "log")]
        ::log::warn!($s $(, $x)*);
        #[cfg(feature = "esp32-log")]
        ::esp_println::println!($s $(, $x)*);
        #[cfg(not(any(feature = "defmt", feature = "log", feature = "esp32-log")))]
        { $( let _ = &$x; )* }
    }};
}

macro_rules! error {
    ($s:literal $(, $x:expr)* $(,)?) => {{
        #[cfg(feature = "defmt")]
        ::defmt::error!($s $(, $x)*);
        #[cfg(feature = "log")]
        ::log::error!($s $(, $x)*);
        #[cfg(feature = "esp32-log")]
        ::esp_println::println!($s $(, $x)*);
        #[cfg(not(any(feature = "defmt", feature = "log", feature = "esp32-log")))]
        { $( let _ = &$x; )* }
    }};
}

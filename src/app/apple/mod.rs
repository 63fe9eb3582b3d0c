pub mod backup;
pub mod devicelink;
pub mod mb2;

#[cfg(feature = "apple")]
pub mod lockdown;
#[cfg(feature = "apple")]
pub mod tls;
#[cfg(feature = "apple")]
pub mod usbmux;
#[cfg(feature = "apple")]
pub mod watcher;

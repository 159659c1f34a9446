//! USB device discovery over the sysfs device tree

mod scanner;

pub use scanner::UsbScanner;

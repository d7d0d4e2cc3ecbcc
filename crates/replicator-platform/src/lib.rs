// Platform abstraction traits shared by the core and the OS backends

pub mod screen;
pub mod window;

//! Reactor: event manager dan timer
//!
//! Menggunakan mio untuk readiness multiplexing (epoll/kqueue).
//! Satu `EventManager` per worker thread; operasi dari thread lain masuk
//! lewat `Remote::post`.

mod event_manager;
mod timer;

pub use event_manager::{EventManager, IoCallback, Remote, Task};
pub use timer::TimerId;

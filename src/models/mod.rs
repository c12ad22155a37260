//! Domain model module declarations.

pub mod instance;
pub mod lab_session;
pub mod pool;
pub mod session;
pub mod template;

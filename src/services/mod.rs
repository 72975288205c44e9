//! Storage and session services shared by every handler.

pub mod session_manager;
pub mod storage_service;

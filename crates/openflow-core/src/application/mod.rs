/// Node action contract and outcome channel
pub mod action_runtime;

/// Instance runner service
pub mod execution_service;

/// Design-time editor session
pub mod editor_session;

//! Chat client state layer: optimistic reducers, action coordinators and
//! polling synchronizers over a pluggable backend gateway.

pub mod actions;
pub mod bus;
pub mod chat;
pub mod config;
pub mod entity;
pub mod error;
pub mod gateway;
pub mod interface;
pub mod manager;
pub mod poller;
pub mod state;
pub mod store;

#[cfg(test)]
mod test_support;

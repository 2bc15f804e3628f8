//! Control plane: single-instance socket, route management API and its client

pub mod api;
pub mod client;
pub mod socket;

pub use api::{AddRequest, ControlApi, RemoveRequest, RouteEntry};
pub use client::ControlClient;
pub use socket::{ControlSocket, SocketState};

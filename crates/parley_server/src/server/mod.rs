#![forbid(unsafe_code)]

pub mod api;
pub mod auth;
pub mod dispatch;
pub mod health;
pub mod moderation;
pub mod presence;
pub mod room_hub;
pub mod session;
pub mod state;
pub mod store;

#[cfg(test)]
mod dispatch_tests;


#[cfg(test)]
mod presence_tests;

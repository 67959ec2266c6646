pub mod config;
pub mod gateway;
pub mod irc;
pub mod mastodon;

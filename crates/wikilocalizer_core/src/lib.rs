pub mod client;
pub mod config;
pub mod gateway;
pub mod localizer;
pub mod publish;
pub mod resolver;
pub mod wikitext;

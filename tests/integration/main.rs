#[path = "../helpers/mod.rs"]
mod helpers;

mod download;
mod entities;

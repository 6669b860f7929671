pub mod admin;
pub mod media_token;

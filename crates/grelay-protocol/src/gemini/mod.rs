pub mod embed_content;
pub mod generate_content;
pub mod types;

pub mod plaintext;
pub mod xkey;

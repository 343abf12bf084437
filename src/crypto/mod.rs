pub mod kdf;
pub mod keystore;

pub use self::kdf::KeyDerivation;
pub use self::keystore::{KeystoreCodec, KeystoreRecord};

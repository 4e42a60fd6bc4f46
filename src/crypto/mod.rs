pub mod blind;

pub use blind::{
    BlindError, BlindSignature, BlindSigner, BlindedMessage, NoncePubKey, Requester, SchnorrSigner,
    SignerPubKey, UnblindedSignature,
};

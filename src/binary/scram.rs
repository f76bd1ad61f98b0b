//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677) used during the handshake.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::EdgeError;

type HmacSha256 = Hmac<Sha256>;

/// The only SASL mechanism the server offers.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("server message is not valid UTF-8")]
    InvalidServerMessage,
    #[error("server rejected authentication: {0}")]
    ServerError(String),
    #[error("invalid salt encoding")]
    InvalidSalt,
    #[error("invalid iteration count")]
    InvalidIterations,
    #[error("server message is missing `{0}`")]
    Missing(&'static str),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("invalid server signature encoding")]
    InvalidServerSignature,
    #[error("server signature verification failed")]
    SignatureMismatch,
    #[error("server final message received before server first message")]
    OutOfOrder,
    #[error("key derivation failed")]
    KeyDerivation,
}

impl From<ScramError> for EdgeError {
    fn from(err: ScramError) -> Self {
        EdgeError::Auth(err.to_string())
    }
}

/// State kept between the two server messages.
struct Exchange {
    auth_message: String,
    salted_password: [u8; 32],
}

pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    exchange: Option<Exchange>,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(username: &str, password: &str, client_nonce: String) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            exchange: None,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", escape_name(&self.username), self.client_nonce)
    }

    /// `n,,n=<user>,r=<nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consume `r=..,s=..,i=..` and produce the client final message.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for (key, value) in attributes(server_first) {
            match key {
                "e" => return Err(ScramError::ServerError(value.to_string())),
                "r" => nonce = Some(value),
                "s" => salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?),
                "i" => {
                    iterations = Some(value.parse::<u32>().map_err(|_| ScramError::InvalidIterations)?)
                }
                _ => {}
            }
        }
        let nonce = nonce.ok_or(ScramError::Missing("r"))?;
        let salt = salt.ok_or(ScramError::Missing("s"))?;
        let iterations = iterations.ok_or(ScramError::Missing("i"))?;
        if iterations == 0 {
            return Err(ScramError::InvalidIterations);
        }
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let salted_password = hi(&self.password, &salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!("{},{},{}", self.client_first_bare(), server_first, without_proof);
        let signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        proof.iter_mut().zip(signature).for_each(|(p, s)| *p ^= s);

        self.exchange = Some(Exchange {
            auth_message,
            salted_password,
        });
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the `v=<signature>` server final message.
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_final =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;
        let exchange = self.exchange.as_ref().ok_or(ScramError::OutOfOrder)?;

        let mut verifier = None;
        for (key, value) in attributes(server_final) {
            match key {
                "e" => return Err(ScramError::ServerError(value.to_string())),
                "v" => verifier = Some(value),
                _ => {}
            }
        }
        let verifier = verifier.ok_or(ScramError::Missing("v"))?;
        let received = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let server_key = hmac_sha256(&exchange.salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, exchange.auth_message.as_bytes())?;
        if received.as_slice() != expected.as_slice() {
            return Err(ScramError::SignatureMismatch);
        }
        Ok(())
    }
}

/// `k=v` pairs of a SCRAM message. Values may themselves contain `=`.
fn attributes(msg: &str) -> impl Iterator<Item = (&str, &str)> {
    msg.split(',').filter_map(|part| part.split_once('='))
}

/// RFC 5802 saslname escaping.
fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::KeyDerivation)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::KeyDerivation)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

//! Client side of PostgreSQL password authentication, used when the proxy
//! logs in to the upstream server.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScramError {
    #[error("malformed server-first-message")]
    MalformedServerFirst,
    #[error("server nonce does not extend client nonce")]
    NonceMismatch,
    #[error("malformed server-final-message")]
    MalformedServerFinal,
    #[error("server rejected authentication: {0}")]
    ServerError(String),
    #[error("server signature mismatch")]
    SignatureMismatch,
}

/// MD5 password response: `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = format!("{:x}", hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{:x}", hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// SCRAM-SHA-256 exchange without channel binding.
///
/// The username in the SCRAM messages is left empty: the server takes it from
/// the startup packet, as libpq does.
pub struct ScramClient {
    password: String,
    client_nonce: String,
    expected_server_signature: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        let nonce: String = rand::rng()
            .sample_iter(&rand::distr::Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::with_nonce(password, &nonce)
    }

    pub fn with_nonce(password: &str, client_nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            client_nonce: client_nonce.to_string(),
            expected_server_signature: None,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n=,r={}", self.client_nonce)
    }

    /// `client-first-message`, sent in `SASLInitialResponse`.
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare())
    }

    /// Consume `server-first-message` and produce `client-final-message`.
    pub fn client_final(&mut self, server_first: &str) -> Result<String, ScramError> {
        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                server_nonce = Some(v);
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(v);
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = v.parse::<u32>().ok();
            }
        }
        let (Some(server_nonce), Some(salt), Some(iterations)) = (server_nonce, salt, iterations)
        else {
            return Err(ScramError::MalformedServerFirst);
        };
        if !server_nonce.starts_with(&self.client_nonce) || server_nonce == self.client_nonce {
            return Err(ScramError::NonceMismatch);
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|_| ScramError::MalformedServerFirst)?;

        let mut salted_password = [0u8; 32];
        pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        // "biws" is base64("n,,").
        let client_final_without_proof = format!("c=biws,r={}", server_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        self.expected_server_signature = Some(hmac_sha256(&server_key, auth_message.as_bytes()));

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(&proof)
        ))
    }

    /// Check `server-final-message` against the signature computed in
    /// [`Self::client_final`].
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), ScramError> {
        if let Some(error) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerError(error.to_string()));
        }
        let signature = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .and_then(|v| BASE64.decode(v).ok())
            .ok_or(ScramError::MalformedServerFinal)?;
        match self.expected_server_signature {
            Some(expected) if expected[..] == signature[..] => Ok(()),
            _ => Err(ScramError::SignatureMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    #[test]
    fn test_md5_password() {
        assert_eq!(
            md5_password("alice", "s3cret", &[1, 2, 3, 4]),
            "md5b79948bbeb35dee03ab8fe15a839030b"
        );
    }

    #[test]
    fn test_scram_exchange() {
        let mut client = ScramClient::with_nonce("pencil", "rOprNGfwEbeRWgbNEkqO");
        assert_eq!(client.client_first(), "n,,n=,r=rOprNGfwEbeRWgbNEkqO");

        let client_final = client.client_final(SERVER_FIRST).unwrap();
        assert_eq!(
            client_final,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=qvT2SWdEH5Q06albL+hjSYuUhCG7VndFyzIb7CK4n9k="
        );

        client
            .verify_server_final("v=3HO6Qt1M4MKJrmlKaoOqLAI0/0TV0HZe7J9H3MBtSOg=")
            .unwrap();
        assert_eq!(
            client.verify_server_final("v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4="),
            Err(ScramError::SignatureMismatch)
        );
    }

    #[test]
    fn test_scram_rejects_foreign_nonce() {
        let mut client = ScramClient::with_nonce("pencil", "abc");
        assert_eq!(
            client.client_final(SERVER_FIRST),
            Err(ScramError::NonceMismatch)
        );
        assert_eq!(
            client.verify_server_final("e=invalid-proof"),
            Err(ScramError::ServerError("invalid-proof".to_string()))
        );
    }

    #[test]
    fn test_random_nonce() {
        let a = ScramClient::new("x");
        let b = ScramClient::new("x");
        assert_ne!(a.client_first(), b.client_first());
    }
}

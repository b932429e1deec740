//! Auth key exchange.
//!
//! The exchange runs over unencrypted messages right after a transport
//! connects. This type only builds and checks message bodies; the
//! connection manager wraps them in the plain envelope and moves them over
//! the transport.
//!
//! ```text
//! req_pq                 ->
//!                        <- resPQ
//! req_DH_params          ->
//!                        <- server_DH_params_ok
//! set_client_DH_params   ->
//!                        <- dh_gen_ok | dh_gen_retry | dh_gen_fail
//! ```

use crate::error::HandshakeError;
use crate::state::HandshakeStep;
use bytes::Bytes;
use mtproto_crypto::dh::{self, DhParams};
use mtproto_crypto::factor::{factorize, u64_from_be, u64_to_be};
use mtproto_crypto::hash::{ct_eq, sha1};
use mtproto_crypto::kdf::{handshake_key_iv, initial_salt, new_nonce_hash};
use mtproto_crypto::{aes_ige, AuthKey, CryptoError, RsaKeyRing, AUTH_KEY_SIZE};
use mtproto_wire::{
    ClientDhInnerData, DhGenAnswer, DhGenKind, PqInnerData, ReqDhParams, ReqPq, ResPq,
    ServerDhInnerData, ServerDhParams, SetClientDhParams, WireError,
};
use rand::RngCore;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size `p_q_inner_data` plus its hash is padded to before RSA
const RSA_DATA_SIZE: usize = 255;
/// SHA-1 digest size
const HASH_SIZE: usize = 20;

/// Result of a completed exchange
#[derive(Debug)]
pub struct AuthKeyResult {
    /// The new key
    pub auth_key: AuthKey,
    /// Salt to use until the server sends another
    pub server_salt: u64,
    /// Server clock at the time of the exchange
    pub server_time: i32,
}

/// What to do after feeding a server message to the exchange
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Send this body unencrypted and wait for the answer
    Send(Bytes),
    /// The key is ready
    Done(AuthKeyResult),
}

/// Secrets of one exchange attempt, wiped when the attempt ends
#[derive(Default, Zeroize, ZeroizeOnDrop)]
struct AuthKeyCreateData {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
    tmp_key: [u8; 32],
    tmp_iv: [u8; 32],
    g: u32,
    dh_prime: Vec<u8>,
    g_a: Vec<u8>,
    server_time: i32,
    retry_id: u64,
    retries: u32,
    auth_key: Vec<u8>,
}

/// Client side of the auth key exchange
pub struct AuthKeyHandshake {
    rsa_keys: RsaKeyRing,
    max_retries: u32,
    step: Option<HandshakeStep>,
    params: Option<DhParams>,
    data: AuthKeyCreateData,
}

impl std::fmt::Debug for AuthKeyHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthKeyHandshake")
            .field("step", &self.step)
            .field("retries", &self.data.retries)
            .finish_non_exhaustive()
    }
}

impl AuthKeyHandshake {
    /// Create an exchange trusting `rsa_keys` and accepting up to
    /// `max_retries` `dh_gen_retry` answers
    pub fn new(rsa_keys: RsaKeyRing, max_retries: u32) -> Self {
        Self {
            rsa_keys,
            max_retries,
            step: None,
            params: None,
            data: AuthKeyCreateData::default(),
        }
    }

    /// Step the exchange is waiting in, `None` before start or after completion
    pub fn step(&self) -> Option<HandshakeStep> {
        self.step
    }

    /// Begin the exchange and return the `req_pq` body
    pub fn start(&mut self) -> Bytes {
        self.data.zeroize();
        self.params = None;
        rand::thread_rng().fill_bytes(&mut self.data.nonce);
        self.step = Some(HandshakeStep::PqSent);
        debug!("Starting auth key exchange");
        ReqPq {
            nonce: self.data.nonce,
        }
        .to_bytes()
    }

    /// Feed the body of an unencrypted server message
    pub fn handle(&mut self, body: &[u8]) -> Result<HandshakeOutcome, HandshakeError> {
        match self.step {
            Some(HandshakeStep::PqSent) => self.handle_res_pq(body),
            Some(HandshakeStep::DhParamsSent) => self.handle_server_dh_params(body),
            Some(HandshakeStep::DhClientParamsSent) => self.handle_dh_gen(body),
            None => Err(HandshakeError::UnexpectedStep("idle")),
        }
    }

    fn check_nonces(&self, nonce: &[u8; 16], server_nonce: &[u8; 16]) -> Result<(), HandshakeError> {
        if !ct_eq(nonce, &self.data.nonce) {
            return Err(HandshakeError::NonceMismatch);
        }
        if !ct_eq(server_nonce, &self.data.server_nonce) {
            return Err(HandshakeError::ServerNonceMismatch);
        }
        Ok(())
    }

    fn handle_res_pq(&mut self, body: &[u8]) -> Result<HandshakeOutcome, HandshakeError> {
        let res_pq = ResPq::parse(body)?;
        if !ct_eq(&res_pq.nonce, &self.data.nonce) {
            return Err(HandshakeError::NonceMismatch);
        }

        let key = self
            .rsa_keys
            .find(&res_pq.fingerprints)
            .ok_or_else(|| HandshakeError::NoMatchingKey(res_pq.fingerprints.clone()))?;

        let pq = u64_from_be(&res_pq.pq)?;
        let (p, q) = factorize(pq)?;
        debug!("Factored pq {} into {} * {}", pq, p, q);

        self.data.server_nonce = res_pq.server_nonce;
        rand::thread_rng().fill_bytes(&mut self.data.new_nonce);

        let inner = PqInnerData {
            pq: res_pq.pq.clone(),
            p: u64_to_be(p),
            q: u64_to_be(q),
            nonce: self.data.nonce,
            server_nonce: self.data.server_nonce,
            new_nonce: self.data.new_nonce,
        }
        .to_bytes();
        if HASH_SIZE + inner.len() > RSA_DATA_SIZE {
            return Err(CryptoError::RsaInputTooLarge(HASH_SIZE + inner.len()).into());
        }

        let mut data_with_hash = Vec::with_capacity(RSA_DATA_SIZE);
        data_with_hash.extend_from_slice(&sha1(&[&inner]));
        data_with_hash.extend_from_slice(&inner);
        let used = data_with_hash.len();
        data_with_hash.resize(RSA_DATA_SIZE, 0);
        rand::thread_rng().fill_bytes(&mut data_with_hash[used..]);

        let encrypted = key.encrypt(&data_with_hash);
        data_with_hash.zeroize();

        let request = ReqDhParams {
            nonce: self.data.nonce,
            server_nonce: self.data.server_nonce,
            p: u64_to_be(p),
            q: u64_to_be(q),
            fingerprint: key.fingerprint(),
            encrypted_data: encrypted?,
        };
        self.step = Some(HandshakeStep::DhParamsSent);
        Ok(HandshakeOutcome::Send(request.to_bytes()))
    }

    fn handle_server_dh_params(&mut self, body: &[u8]) -> Result<HandshakeOutcome, HandshakeError> {
        let encrypted_answer = match ServerDhParams::parse(body)? {
            ServerDhParams::Fail {
                nonce,
                server_nonce,
                ..
            } => {
                self.check_nonces(&nonce, &server_nonce)?;
                return Err(HandshakeError::DhParamsFailed);
            }
            ServerDhParams::Ok {
                nonce,
                server_nonce,
                encrypted_answer,
            } => {
                self.check_nonces(&nonce, &server_nonce)?;
                encrypted_answer
            }
        };

        let tmp = handshake_key_iv(&self.data.new_nonce, &self.data.server_nonce);
        self.data.tmp_key = tmp.key;
        self.data.tmp_iv = tmp.iv;

        let mut answer = encrypted_answer;
        aes_ige::decrypt(&self.data.tmp_key, &self.data.tmp_iv, &mut answer)?;
        let parsed = Self::parse_answer(&answer);
        answer.zeroize();
        let inner = parsed?;

        self.check_nonces(&inner.nonce, &inner.server_nonce)?;
        let params = dh::validate_dh_params(&inner.dh_prime, inner.g)?;

        self.data.g = params.g();
        self.data.dh_prime = inner.dh_prime;
        self.data.g_a = inner.g_a;
        self.data.server_time = inner.server_time;
        self.data.retry_id = 0;
        self.params = Some(params);

        self.client_dh_params()
    }

    /// Split `SHA1(inner) | inner | padding` and check the hash
    fn parse_answer(answer: &[u8]) -> Result<ServerDhInnerData, HandshakeError> {
        if answer.len() < HASH_SIZE {
            return Err(WireError::Truncated(answer.len()).into());
        }
        let (inner, consumed) = ServerDhInnerData::parse_prefix(&answer[HASH_SIZE..])?;
        let padding = answer.len() - HASH_SIZE - consumed;
        if padding >= 16 || !ct_eq(&sha1(&[&answer[HASH_SIZE..HASH_SIZE + consumed]]), &answer[..HASH_SIZE]) {
            return Err(HandshakeError::AnswerHashMismatch);
        }
        Ok(inner)
    }

    fn client_dh_params(&mut self) -> Result<HandshakeOutcome, HandshakeError> {
        let params = self
            .params
            .as_ref()
            .ok_or(HandshakeError::UnexpectedStep("client dh params"))?;
        let exchange = dh::compute_exchange(params, &self.data.g_a, &mut rand::thread_rng())?;
        self.data.auth_key.zeroize();
        self.data.auth_key = exchange.shared.to_vec();

        let inner = ClientDhInnerData {
            nonce: self.data.nonce,
            server_nonce: self.data.server_nonce,
            retry_id: self.data.retry_id,
            g_b: exchange.g_b.clone(),
        }
        .to_bytes();

        let unpadded = HASH_SIZE + inner.len();
        let mut data = Vec::with_capacity(unpadded + 16);
        data.extend_from_slice(&sha1(&[&inner]));
        data.extend_from_slice(&inner);
        data.resize(unpadded + (16 - unpadded % 16) % 16, 0);
        rand::thread_rng().fill_bytes(&mut data[unpadded..]);
        aes_ige::encrypt(&self.data.tmp_key, &self.data.tmp_iv, &mut data)?;

        self.step = Some(HandshakeStep::DhClientParamsSent);
        Ok(HandshakeOutcome::Send(
            SetClientDhParams {
                nonce: self.data.nonce,
                server_nonce: self.data.server_nonce,
                encrypted_data: data,
            }
            .to_bytes(),
        ))
    }

    fn handle_dh_gen(&mut self, body: &[u8]) -> Result<HandshakeOutcome, HandshakeError> {
        let answer = DhGenAnswer::parse(body)?;
        self.check_nonces(&answer.nonce, &answer.server_nonce)?;

        let mut raw = [0u8; AUTH_KEY_SIZE];
        if self.data.auth_key.len() != AUTH_KEY_SIZE {
            return Err(HandshakeError::UnexpectedStep("dh gen without key"));
        }
        raw.copy_from_slice(&self.data.auth_key);
        let auth_key = AuthKey::new(raw);
        raw.zeroize();

        let expected = new_nonce_hash(
            &self.data.new_nonce,
            answer.kind.hash_number(),
            auth_key.aux_hash(),
        );
        if !ct_eq(&expected, &answer.new_nonce_hash) {
            return Err(HandshakeError::NewNonceHashMismatch);
        }

        match answer.kind {
            DhGenKind::Ok => {
                let server_salt = initial_salt(&self.data.new_nonce, &self.data.server_nonce);
                let server_time = self.data.server_time;
                info!("Auth key exchange complete (key id {:#018x})", auth_key.id());
                self.step = None;
                self.params = None;
                self.data.zeroize();
                Ok(HandshakeOutcome::Done(AuthKeyResult {
                    auth_key,
                    server_salt,
                    server_time,
                }))
            }
            DhGenKind::Retry => {
                self.data.retries += 1;
                if self.data.retries > self.max_retries {
                    return Err(HandshakeError::TooManyRetries(self.data.retries));
                }
                warn!("Server asked to retry the DH exchange ({})", self.data.retries);
                self.data.retry_id = auth_key.aux_hash();
                self.client_dh_params()
            }
            DhGenKind::Fail => Err(HandshakeError::DhGenFailed),
        }
    }
}

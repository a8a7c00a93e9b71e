use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::engine::{Engine, general_purpose::STANDARD};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Fixed client secret; used whenever no account key applies.
pub const USER_KEY: &[u8; 16] = b"XFmi9GS2hzk98jGX";

/// The upstream uses one static IV for every envelope.
const IV: &[u8; 16] = b"wNSOYIB1k1DjY5lA";

/// Channel sentinel that always selects [`USER_KEY`].
pub const CHANNEL_API_USER: &str = "api-user";

/// Parameter envelope codec: AES-128-CBC + PKCS#7, wrapped in standard
/// base64. The access key is the first 16 bytes of the bound account token;
/// until one is bound every channel falls back to the user key.
///
/// Both directions soft-degrade: anything that cannot be transformed is
/// returned unchanged and the caller deals with the consequences when it
/// tries to parse the result.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec {
    access_key: Option<[u8; 16]>,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self { access_key: None }
    }

    pub fn with_token(token: &str) -> Self {
        let mut codec = Self::new();
        codec.bind_token(token);
        codec
    }

    /// Derive the access key from an account token. Tokens shorter than
    /// 16 bytes leave the codec on the user-key fallback.
    pub fn bind_token(&mut self, token: &str) {
        let bytes = token.as_bytes();
        if bytes.len() >= 16 {
            let mut key = [0u8; 16];
            key.copy_from_slice(&bytes[..16]);
            self.access_key = Some(key);
        }
    }

    fn key_for(&self, channel: &str) -> &[u8; 16] {
        if channel == CHANNEL_API_USER {
            USER_KEY
        } else {
            self.access_key.as_ref().unwrap_or(USER_KEY)
        }
    }

    /// Encrypt a parameter blob for the given channel.
    pub fn encrypt(&self, plain: &str, channel: &str) -> String {
        let key = GenericArray::from_slice(self.key_for(channel));
        let iv = GenericArray::from_slice(IV);
        let ciphertext =
            Aes128CbcEnc::new(key, iv).encrypt_padded_vec_mut::<Pkcs7>(plain.as_bytes());
        STANDARD.encode(ciphertext)
    }

    /// Decrypt a response `DATA` blob. Tolerates stripped base64 padding;
    /// returns the input unchanged when it is not a valid envelope.
    pub fn decrypt(&self, data: &str, channel: &str) -> String {
        let key = GenericArray::from_slice(self.key_for(channel));
        let iv = GenericArray::from_slice(IV);

        let Ok(raw) = STANDARD.decode(pad_base64(data).as_ref()) else {
            return data.to_string();
        };
        match Aes128CbcDec::new(key, iv).decrypt_padded_vec_mut::<Pkcs7>(&raw) {
            Ok(plain) => String::from_utf8(plain).unwrap_or_else(|_| data.to_string()),
            Err(_) => data.to_string(),
        }
    }
}

/// The upstream strips `=` padding from some payloads; restore it so the
/// length is a multiple of 4 before decoding.
fn pad_base64(data: &str) -> std::borrow::Cow<'_, str> {
    match data.len() % 4 {
        0 => std::borrow::Cow::Borrowed(data),
        rem => {
            let mut padded = String::with_capacity(data.len() + 4 - rem);
            padded.push_str(data);
            for _ in 0..(4 - rem) {
                padded.push('=');
            }
            std::borrow::Cow::Owned(padded)
        }
    }
}

//! Sources for the opaque nonce sent with token exchanges

/// A type that provides nonces for token exchange requests
pub trait NonceSource: Send + Sync {
    /// Produces the nonce for the next request
    fn nonce(&self) -> String;
}

impl<T: NonceSource + ?Sized> NonceSource for std::sync::Arc<T> {
    #[inline]
    fn nonce(&self) -> String {
        (**self).nonce()
    }
}

/// A nonce source that always sends the same value
#[derive(Clone, Debug)]
pub struct StaticNonce(String);

impl StaticNonce {
    /// Constructs a nonce source that always returns `nonce`
    pub fn new(nonce: impl Into<String>) -> Self {
        Self(nonce.into())
    }
}

impl Default for StaticNonce {
    /// The literal `nonce`, as expected by the Contxt authorization server
    fn default() -> Self {
        Self::new("nonce")
    }
}

impl NonceSource for StaticNonce {
    #[inline]
    fn nonce(&self) -> String {
        self.0.clone()
    }
}

mod random {
    use rand::{distributions::Alphanumeric, Rng};

    /// Generates a fresh random alphanumeric nonce for every request
    #[derive(Clone, Copy, Debug)]
    pub struct RandomNonce {
        len: usize,
    }

    impl RandomNonce {
        /// Constructs a source of random nonces `len` characters long
        pub const fn new(len: usize) -> Self {
            Self { len }
        }
    }

    impl Default for RandomNonce {
        fn default() -> Self {
            Self::new(32)
        }
    }

    impl super::NonceSource for RandomNonce {
        fn nonce(&self) -> String {
            random_string(self.len)
        }
    }

    pub(crate) fn random_string(len: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }
}

pub use random::RandomNonce;
pub(crate) use random::random_string;

use aliri_braid::braid;
use std::fmt;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// The configured name of an audience, such as `facilities`
#[braid(serde)]
pub struct AudienceName;

/// A client ID, either of an audience or of this application
#[braid(serde)]
pub struct ClientId;

/// A client secret used by machine sessions
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

limited_reveal!(ClientSecretRef: "CLIENT SECRET", 5);

/// An access token, either a primary credential or an audience API token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

limited_reveal!(AccessTokenRef: "ACCESS TOKEN", 15);

/// A user's password for the password grant
#[braid(serde, debug = "owned", display = "owned")]
pub struct Password;

limited_reveal!(PasswordRef: "PASSWORD", 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_hidden_by_default() {
        let token = AccessToken::from_static("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
        assert_eq!(token.to_string(), "***ACCESS TOKEN***");
    }

    #[test]
    fn alternate_debug_reveals_a_bounded_prefix() {
        let secret = ClientSecret::from_static("super-secret-value");
        assert_eq!(format!("{:#?}", secret), "\"supe…\"");
    }

    #[test]
    fn passwords_never_reveal_content() {
        let password = Password::from_static("hunter2");
        assert_eq!(format!("{:#?}", password), "\"…\"");
    }
}

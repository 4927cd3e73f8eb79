use async_trait::async_trait;

/// Checks the password a connection presents in its `auth` request.
#[async_trait]
pub trait AuthSource: Send + Sync {
    async fn verify(&self, password: &str) -> bool;
}

/// One password shared by every client, from `SLOTBOOK_PASSWORD`.
#[derive(Debug)]
pub struct SharedPasswordAuth {
    password: String,
}

impl SharedPasswordAuth {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPasswordAuth {
    async fn verify(&self, password: &str) -> bool {
        constant_time_eq(self.password.as_bytes(), password.as_bytes())
    }
}

/// Runs in time dependent only on the lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

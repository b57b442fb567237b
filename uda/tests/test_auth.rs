use std::sync::Arc;

use tokio::net::TcpListener;

use uda::auth::{Authenticator, ServerAuthenticator};
use uda::{Client, Result, Server, UdaError};

use crate::{test_environment, test_registry};

/// Shared-secret token exchange. The real system encrypts these; the slots
/// and their ordering are what matters here.
struct SecretAuth {
    secret: &'static [u8],
}

impl Authenticator for SecretAuth {
    fn initial_token(&self) -> Vec<u8> {
        self.secret.to_vec()
    }

    fn respond(&self, challenge: &[u8]) -> Result<Vec<u8>> {
        let mut response = challenge.to_vec();
        response.extend_from_slice(self.secret);
        Ok(response)
    }

    fn verify(&self, proof: &[u8]) -> Result<()> {
        if proof == b"ok" {
            Ok(())
        } else {
            Err(UdaError::Auth("server proof rejected".to_string()))
        }
    }
}

impl ServerAuthenticator for SecretAuth {
    fn challenge(&self, claim: &[u8]) -> Result<Vec<u8>> {
        if claim != self.secret {
            return Err(UdaError::Auth("unknown identity claim".to_string()));
        }
        Ok(b"nonce".to_vec())
    }

    fn verify_response(&self, response: &[u8]) -> Result<Vec<u8>> {
        let mut expected = b"nonce".to_vec();
        expected.extend_from_slice(self.secret);
        if response == expected {
            Ok(b"ok".to_vec())
        } else {
            Err(UdaError::Auth("challenge response rejected".to_string()))
        }
    }
}

async fn start_auth_server() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut server = Server::new(test_registry(), test_environment(port));
    server.set_authenticator(Arc::new(SecretAuth { secret: b"sesame" }));
    tokio::spawn(server.serve(listener));
    port
}

#[tokio::test]
async fn mutual_authentication_then_data() {
    let port = start_auth_server().await;
    let mut client = Client::with_environment(test_environment(port));
    client.set_authenticator(Box::new(SecretAuth { secret: b"sesame" }));

    let handle = client.get("", "help::ping()").await.unwrap();
    let block = client.block(handle).unwrap();
    assert_eq!(block.data_string().unwrap(), "pong");
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let port = start_auth_server().await;
    let mut client = Client::with_environment(test_environment(port));
    client.set_authenticator(Box::new(SecretAuth { secret: b"swordfish" }));

    let err = client.get("", "help::ping()").await.unwrap_err();
    assert!(matches!(err, UdaError::Auth(_) | UdaError::Protocol(_) | UdaError::System(_)));
}

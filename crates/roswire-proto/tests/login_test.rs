// Login handshake flows against a scripted mock device.

mod support;

use pretty_assertions::assert_eq;
use secrecy::SecretString;

use roswire_proto::{Connection, Error, LoginScheme, TransportConfig, auth};
use support::{accept, bind, param_of, tag_of};

const CHALLENGE: &str = "00112233445566778899aabbccddeeff";
// md5(b"\x00" + b"hunter2" + bytes.fromhex(CHALLENGE)), via Python hashlib
const HUNTER2_RESPONSE: &str = "0052ff5a8aee64b8373b641c809d66767a";

async fn connect(port: u16) -> Connection {
    Connection::open("127.0.0.1", port, &TransportConfig::default())
        .await
        .unwrap()
}

fn secret(s: &str) -> SecretString {
    SecretString::from(s.to_string())
}

#[tokio::test]
async fn challenge_login_round_trips() {
    let (listener, port) = bind().await;
    let conn = connect(port).await;
    let mut peer = accept(&listener).await;

    let client =
        tokio::spawn(
            async move { auth::login(&conn, "admin", &secret("hunter2"), LoginScheme::Challenge).await },
        );

    // round one: name only, challenge comes back on the !done
    let words = peer.read_sentence().await;
    assert_eq!(words[0], "/login");
    assert_eq!(param_of(&words, "name"), Some("admin"));
    assert_eq!(param_of(&words, "password"), None);
    let tag = tag_of(&words);
    peer.write_sentence(&["!done", &format!("=ret={CHALLENGE}"), &format!(".tag={tag}")])
        .await;

    // round two: derived response, no plaintext password on the wire
    let words = peer.read_sentence().await;
    assert_eq!(words[0], "/login");
    assert_eq!(param_of(&words, "response"), Some(HUNTER2_RESPONSE));
    assert_eq!(param_of(&words, "password"), None);
    let tag = tag_of(&words);
    peer.write_sentence(&["!done", &format!(".tag={tag}")]).await;

    client.await.unwrap().unwrap();
}

#[tokio::test]
async fn challenge_login_rejection_is_an_auth_error() {
    let (listener, port) = bind().await;
    let conn = connect(port).await;
    let mut peer = accept(&listener).await;

    let client =
        tokio::spawn(
            async move { auth::login(&conn, "admin", &secret("wrong"), LoginScheme::Challenge).await },
        );

    let tag = tag_of(&peer.read_sentence().await);
    peer.write_sentence(&["!done", &format!("=ret={CHALLENGE}"), &format!(".tag={tag}")])
        .await;

    let tag = tag_of(&peer.read_sentence().await);
    peer.write_sentence(&[
        "!trap",
        "=message=cannot log in",
        &format!(".tag={tag}"),
    ])
    .await;

    let err = client.await.unwrap().unwrap_err();
    assert!(err.is_auth(), "expected auth error, got {err:?}");
    assert!(!err.is_connectivity());
}

#[tokio::test]
async fn plain_login_succeeds_in_one_round() {
    let (listener, port) = bind().await;
    let conn = connect(port).await;
    let mut peer = accept(&listener).await;

    let client =
        tokio::spawn(
            async move { auth::login(&conn, "admin", &secret("hunter2"), LoginScheme::Plain).await },
        );

    let words = peer.read_sentence().await;
    assert_eq!(words[0], "/login");
    assert_eq!(param_of(&words, "name"), Some("admin"));
    assert_eq!(param_of(&words, "password"), Some("hunter2"));
    let tag = tag_of(&words);
    peer.write_sentence(&["!done", &format!(".tag={tag}")]).await;

    client.await.unwrap().unwrap();
}

#[tokio::test]
async fn plain_login_downgrades_once_when_trap_carries_a_challenge() {
    let (listener, port) = bind().await;
    let conn = connect(port).await;
    let mut peer = accept(&listener).await;

    let client =
        tokio::spawn(
            async move { auth::login(&conn, "admin", &secret("hunter2"), LoginScheme::Plain).await },
        );

    let tag = tag_of(&peer.read_sentence().await);
    peer.write_sentence(&[
        "!trap",
        "=message=invalid user name or password",
        &format!("=ret={CHALLENGE}"),
        &format!(".tag={tag}"),
    ])
    .await;

    // exactly one additional round: the challenge response
    let words = peer.read_sentence().await;
    assert_eq!(words[0], "/login");
    assert_eq!(param_of(&words, "response"), Some(HUNTER2_RESPONSE));
    assert_eq!(param_of(&words, "password"), None);
    let tag = tag_of(&words);
    peer.write_sentence(&["!done", &format!(".tag={tag}")]).await;

    client.await.unwrap().unwrap();
}

#[tokio::test]
async fn plain_login_handles_challenge_on_done() {
    // firmware predating plain login answers the first /login with a
    // challenge on the !done instead of a verdict
    let (listener, port) = bind().await;
    let conn = connect(port).await;
    let mut peer = accept(&listener).await;

    let client =
        tokio::spawn(
            async move { auth::login(&conn, "admin", &secret("hunter2"), LoginScheme::Plain).await },
        );

    let tag = tag_of(&peer.read_sentence().await);
    peer.write_sentence(&["!done", &format!("=ret={CHALLENGE}"), &format!(".tag={tag}")])
        .await;

    let words = peer.read_sentence().await;
    assert_eq!(param_of(&words, "response"), Some(HUNTER2_RESPONSE));
    let tag = tag_of(&words);
    peer.write_sentence(&["!done", &format!(".tag={tag}")]).await;

    client.await.unwrap().unwrap();
}

#[tokio::test]
async fn plain_login_rejection_without_challenge_is_an_auth_error() {
    let (listener, port) = bind().await;
    let conn = connect(port).await;
    let mut peer = accept(&listener).await;

    let client =
        tokio::spawn(
            async move { auth::login(&conn, "admin", &secret("wrong"), LoginScheme::Plain).await },
        );

    let tag = tag_of(&peer.read_sentence().await);
    peer.write_sentence(&["!trap", "=message=invalid user name or password", &format!(".tag={tag}")])
        .await;

    let err = client.await.unwrap().unwrap_err();
    match err {
        Error::Authentication { message } => {
            assert_eq!(message, "invalid user name or password");
        }
        other => panic!("expected Authentication, got {other:?}"),
    }
}

#[tokio::test]
async fn socket_loss_during_login_stays_a_connectivity_error() {
    let (listener, port) = bind().await;
    let conn = connect(port).await;
    let mut peer = accept(&listener).await;

    let client =
        tokio::spawn(
            async move { auth::login(&conn, "admin", &secret("hunter2"), LoginScheme::Plain).await },
        );

    let _ = peer.read_sentence().await;
    drop(peer); // device dies mid-handshake

    let err = client.await.unwrap().unwrap_err();
    assert!(err.is_connectivity(), "expected connectivity error, got {err:?}");
    assert!(!err.is_auth());
}

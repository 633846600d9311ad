// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use parley_core::{Frame, ProtocolMessage};
use parley_encryption::test_utils::published_key;
use parley_encryption::traits::{Encrypt, Sign};
use parley_encryption::{ConnectionEntry, KeyId, KeysIndex, RsaPublicKey, SessionKeys, SignsIndex};
use tokio::sync::broadcast;

use crate::test_utils::{MemoryRelay, RelayClient, setup_logging, test_config};
use crate::{
    Autosave, ChatClient, ChatError, ChatEvent, Config, EncryptedStore, MemoryStorage,
    ProtocolClient, ProtocolEvent, Session, SessionError, SessionEvent, StoreState,
};

const TIMEOUT: Duration = Duration::from_secs(10);

const PASSWORD: &str = "hunter2";

async fn next<E: Clone>(rx: &mut broadcast::Receiver<E>) -> E {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_for_session(rx: &mut broadcast::Receiver<SessionEvent>, expected: SessionEvent) {
    loop {
        if next(rx).await == expected {
            return;
        }
    }
}

/// Like [`wait_for_session`] but without a timeout, for tests running on paused time where the
/// timeout would fire before any reconnect interval elapsed.
async fn wait_for_session_paused(
    rx: &mut broadcast::Receiver<SessionEvent>,
    expected: SessionEvent,
) {
    loop {
        if rx.recv().await.expect("event channel closed") == expected {
            return;
        }
    }
}

struct Peer {
    chat: ChatClient<RelayClient>,
    protocol: ProtocolClient<RelayClient>,
    keys: KeysIndex,
    signs: SignsIndex,
    events: broadcast::Receiver<ChatEvent>,
    session: Session,
    session_events: broadcast::Receiver<SessionEvent>,
    autosave: Option<Autosave>,
}

impl Peer {
    async fn new(relay: &MemoryRelay, config: &Config) -> Self {
        Self::restored(relay, config, StoreState::default()).await
    }

    async fn restored(relay: &MemoryRelay, config: &Config, state: StoreState) -> Self {
        Self::start(relay, config, state, None).await
    }

    /// Starts a peer from whatever was saved in the storage and saves every change back to it.
    async fn persistent(relay: &MemoryRelay, config: &Config, storage: &MemoryStorage) -> Self {
        let store = EncryptedStore::open(storage.clone(), PASSWORD, config)
            .await
            .unwrap();
        let state = store.load().await.unwrap().unwrap_or_default();
        Self::start(relay, config, state, Some(store)).await
    }

    /// Starts a peer from persisted state and waits until it is connected and resynced.
    async fn start(
        relay: &MemoryRelay,
        config: &Config,
        state: StoreState,
        store: Option<EncryptedStore<MemoryStorage>>,
    ) -> Self {
        let keys = KeysIndex::new();
        let signs = SignsIndex::new();
        state.seed(&keys, &signs);

        let protocol =
            ProtocolClient::new(Arc::new(relay.client()), keys.clone(), signs.clone(), config);
        protocol.restore_checkpoint(state.checkpoint);

        let chat = ChatClient::new(protocol.clone(), keys.clone(), signs.clone(), config.clone());
        chat.restore(state.connections, state.published_keys).await;
        let events = chat.subscribe();
        chat.start();
        let autosave = store.map(|store| Autosave::spawn(&chat, store, state.history));

        let session = Session::spawn(protocol.clone(), config.clone());
        let mut session_events = session.subscribe();
        loop {
            if let SessionEvent::Resynced { .. } = next(&mut session_events).await {
                break;
            }
        }

        Self {
            chat,
            protocol,
            keys,
            signs,
            events,
            session,
            session_events,
            autosave,
        }
    }

    /// Destroys the peer and waits until it stopped and saved its state.
    async fn shutdown(self) {
        self.protocol.destroy();
        self.session.closed().await.unwrap();
        if let Some(autosave) = self.autosave {
            autosave.closed().await.unwrap();
        }
    }

    async fn next_event(&mut self) -> ChatEvent {
        next(&mut self.events).await
    }

    fn no_pending_events(&mut self) -> bool {
        matches!(
            self.events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        )
    }
}

struct Established {
    alice: Peer,
    bob: Peer,
    alice_id: KeyId,
    bob_id: KeyId,
    keys: SessionKeys,
}

/// Runs the full handshake between Alice (initiator) and Bob (acceptor).
async fn establish(relay: &MemoryRelay, config: &Config) -> Established {
    let mut alice = Peer::new(relay, config).await;
    let mut bob = Peer::new(relay, config).await;

    let (published_id, published_key) = bob.chat.issue_key("Invite for Alice").await.unwrap();
    let alice_id = alice
        .chat
        .send_connection_request(&published_key, "Alice")
        .await
        .unwrap();
    assert!(alice.chat.connection(&alice_id).await.unwrap().is_requested());

    let ChatEvent::NewPendingConnection { id: bob_id, from_name } = bob.next_event().await else {
        panic!("expected pending connection");
    };
    assert_eq!(from_name, "Alice");
    assert!(bob.chat.connection(&bob_id).await.unwrap().is_pending());
    let published = bob.chat.published_keys().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].id(), published_id);
    assert_eq!(published[0].usage_count(), 1);

    bob.chat.accept_connection(&bob_id).await.unwrap();

    let ChatEvent::ConnectionEstablished { id, keys: bob_keys } = bob.next_event().await else {
        panic!("expected established connection");
    };
    assert_eq!(id, bob_id);

    let ChatEvent::ConnectionEstablished {
        id,
        keys: alice_keys,
    } = alice.next_event().await
    else {
        panic!("expected established connection");
    };
    assert_eq!(id, alice_id);
    assert_eq!(alice_keys, bob_keys);

    Established {
        alice,
        bob,
        alice_id,
        bob_id,
        keys: bob_keys,
    }
}

fn session_frame(keys: &SessionKeys, text: &str, signed: bool) -> Vec<u8> {
    let message = ProtocolMessage::Message { text: text.into() };
    let ciphertext = keys.aes.encrypt(&message.to_bytes().unwrap()).unwrap();
    let signature = signed.then(|| keys.hmac.sign(&ciphertext).unwrap());
    Frame::new(ciphertext, signature).to_bytes().unwrap()
}

#[tokio::test]
async fn handshake_and_messaging() {
    setup_logging();
    let relay = MemoryRelay::new();
    let Established {
        mut alice,
        mut bob,
        alice_id,
        bob_id,
        ..
    } = establish(&relay, &test_config()).await;

    assert!(alice.chat.connection(&alice_id).await.unwrap().is_established());
    assert!(bob.chat.connection(&bob_id).await.unwrap().is_established());

    alice.chat.send_message(&alice_id, "Hi Bob!").await.unwrap();
    let ChatEvent::Message { id, text, .. } = bob.next_event().await else {
        panic!("expected message");
    };
    assert_eq!(id, bob_id);
    assert_eq!(text, "Hi Bob!");

    bob.chat.send_message(&bob_id, "Hi Alice!").await.unwrap();
    let ChatEvent::Message { id, text, .. } = alice.next_event().await else {
        panic!("expected message");
    };
    assert_eq!(id, alice_id);
    assert_eq!(text, "Hi Alice!");

    // Nobody receives their own message.
    assert!(alice.no_pending_events());
    assert!(bob.no_pending_events());
}

#[tokio::test]
async fn decline() {
    setup_logging();
    let relay = MemoryRelay::new();
    let config = test_config();
    let mut alice = Peer::new(&relay, &config).await;
    let mut bob = Peer::new(&relay, &config).await;

    let (_, published_key) = bob.chat.issue_key("Invite").await.unwrap();
    let alice_id = alice
        .chat
        .send_connection_request(&published_key, "Alice")
        .await
        .unwrap();

    let ChatEvent::NewPendingConnection { id: bob_id, .. } = bob.next_event().await else {
        panic!("expected pending connection");
    };
    bob.chat.decline_connection(&bob_id).await.unwrap();

    assert_eq!(
        alice.next_event().await,
        ChatEvent::ConnectionDeclined { id: alice_id }
    );

    // No session material remains on either side.
    assert!(alice.chat.connections().await.is_empty());
    assert!(bob.chat.connections().await.is_empty());
    assert!(alice.keys.is_empty());
    assert!(!alice.signs.has_key(&alice_id));
    assert_eq!(bob.keys.len(), 1, "only the published key remains");
    assert!(!bob.signs.has_key(&bob_id));

    assert!(matches!(
        bob.chat.accept_connection(&bob_id).await,
        Err(ChatError::UnknownConnection(_))
    ));
}

#[tokio::test]
async fn operations_in_wrong_state_fail() {
    let relay = MemoryRelay::new();
    let config = test_config();
    let alice = Peer::new(&relay, &config).await;
    let bob = Peer::new(&relay, &config).await;

    let (_, published_key) = bob.chat.issue_key("Invite").await.unwrap();
    let alice_id = alice
        .chat
        .send_connection_request(&published_key, "Alice")
        .await
        .unwrap();

    // Only the receiving side of a request can accept or decline it.
    assert!(matches!(
        alice.chat.accept_connection(&alice_id).await,
        Err(ChatError::Connection(_))
    ));
    assert!(matches!(
        alice.chat.decline_connection(&alice_id).await,
        Err(ChatError::Connection(_))
    ));
    assert!(matches!(
        alice.chat.send_message(&alice_id, "too early").await,
        Err(ChatError::NotEstablished(_))
    ));
    assert!(alice.chat.connection(&alice_id).await.unwrap().is_requested());
}

#[tokio::test]
async fn stale_events_are_ignored() {
    let relay = MemoryRelay::new();
    let Established {
        mut alice,
        alice_id,
        ..
    } = establish(&relay, &test_config()).await;

    // Replayed handshake messages for an established connection change nothing.
    for message in [
        ProtocolMessage::ConnectionRequestDecline,
        ProtocolMessage::ConnectionEstablished,
        ProtocolMessage::ConnectionRequestAccept {
            ecdh_public_key: vec![1, 2, 3],
        },
    ] {
        alice
            .chat
            .handle_event(ProtocolEvent::Message {
                key_id: alice_id,
                timestamp: 1,
                message,
            })
            .await
            .unwrap();
    }

    // Unknown connections and requests outside of published keys are ignored as well.
    alice
        .chat
        .handle_event(ProtocolEvent::Message {
            key_id: KeyId::random(),
            timestamp: 1,
            message: ProtocolMessage::Message {
                text: "who dis".into(),
            },
        })
        .await
        .unwrap();
    alice
        .chat
        .handle_event(ProtocolEvent::Message {
            key_id: alice_id,
            timestamp: 1,
            message: ProtocolMessage::ConnectionRequest {
                from_name: "Mallory".into(),
                ecdh_public_key: vec![],
                response_rsa_public_key: vec![],
            },
        })
        .await
        .unwrap();

    assert!(alice.chat.connection(&alice_id).await.unwrap().is_established());
    assert_eq!(alice.chat.connections().await.len(), 1);
    assert!(alice.no_pending_events());
}

#[tokio::test]
async fn unsigned_frame_is_rejected_in_established_session() {
    setup_logging();
    let relay = MemoryRelay::new();
    let Established {
        alice,
        mut bob,
        alice_id,
        bob_id,
        keys,
    } = establish(&relay, &test_config()).await;

    // Attacker with knowledge of the encryption key replays an unsigned frame.
    relay.inject(session_frame(&keys, "forged", false));
    assert_eq!(
        bob.next_event().await,
        ChatEvent::SignatureMismatch { id: bob_id }
    );

    // The next delivered message is the authentic one.
    alice.chat.send_message(&alice_id, "authentic").await.unwrap();
    let ChatEvent::Message { text, .. } = bob.next_event().await else {
        panic!("expected message");
    };
    assert_eq!(text, "authentic");
}

#[tokio::test]
async fn resync_after_reconnect_delivers_missed_frames_once() {
    setup_logging();
    let relay = MemoryRelay::new();
    let config = Config {
        reconnect_interval: Duration::from_millis(50),
        ..test_config()
    };
    let Established {
        mut alice, keys, ..
    } = establish(&relay, &config).await;

    relay.disconnect_all();
    wait_for_session(&mut alice.session_events, SessionEvent::Disconnected).await;

    // Frames arriving at the relay while Alice is offline.
    relay.inject_into_history(session_frame(&keys, "missed 1", true));
    relay.inject_into_history(session_frame(&keys, "missed 2", true));

    wait_for_session(&mut alice.session_events, SessionEvent::Connected).await;
    assert_eq!(
        next(&mut alice.session_events).await,
        SessionEvent::Resynced { replayed: 2 }
    );

    for expected in ["missed 1", "missed 2"] {
        let ChatEvent::Message { text, .. } = alice.next_event().await else {
            panic!("expected message");
        };
        assert_eq!(text, expected);
    }

    // Reconnecting again replays nothing.
    relay.disconnect_all();
    wait_for_session(&mut alice.session_events, SessionEvent::Connected).await;
    assert_eq!(
        next(&mut alice.session_events).await,
        SessionEvent::Resynced { replayed: 0 }
    );
    assert!(alice.no_pending_events());
}

#[tokio::test(start_paused = true)]
async fn reconnect_attempts_are_bounded() {
    let relay = MemoryRelay::new();
    relay.set_online(false);
    let config = test_config();

    let protocol = ProtocolClient::new(
        Arc::new(relay.client()),
        KeysIndex::new(),
        SignsIndex::new(),
        &config,
    );
    let started = tokio::time::Instant::now();
    let session = Session::spawn(protocol, config.clone());
    let mut events = session.subscribe();

    let result = session.closed().await;
    assert!(matches!(result, Err(SessionError::ReconnectsExhausted(5))));
    assert_eq!(relay.connect_attempts(), 6);
    assert!(started.elapsed() >= config.reconnect_interval * 5);

    let mut attempts = Vec::new();
    loop {
        match events.try_recv() {
            Ok(SessionEvent::Reconnecting { attempt }) => attempts.push(attempt),
            Ok(SessionEvent::Failed { .. }) => break,
            Ok(event) => panic!("unexpected event {event:?}"),
            Err(err) => panic!("missing failure event: {err}"),
        }
    }
    assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn successful_reconnect_resets_attempts() {
    let relay = MemoryRelay::new();
    let config = test_config();
    let protocol = ProtocolClient::new(
        Arc::new(relay.client()),
        KeysIndex::new(),
        SignsIndex::new(),
        &config,
    );
    let session = Session::spawn(protocol, config.clone());
    let mut events = session.subscribe();
    wait_for_session_paused(&mut events, SessionEvent::Connected).await;

    // Relay goes down for a while but comes back before all attempts are used up.
    relay.set_online(false);
    relay.disconnect_all();
    wait_for_session_paused(&mut events, SessionEvent::Reconnecting { attempt: 3 }).await;
    relay.set_online(true);
    wait_for_session_paused(&mut events, SessionEvent::Connected).await;

    // Counting starts from the beginning again.
    relay.set_online(false);
    relay.disconnect_all();
    wait_for_session_paused(&mut events, SessionEvent::Disconnected).await;
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::Reconnecting { attempt: 1 }
    );
    wait_for_session_paused(&mut events, SessionEvent::Reconnecting { attempt: 5 }).await;
    relay.set_online(true);
    wait_for_session_paused(&mut events, SessionEvent::Connected).await;

    session.destroy();
    assert!(session.closed().await.is_ok());
}

#[tokio::test]
async fn destroy_stops_processing() {
    let relay = MemoryRelay::new();
    let Established {
        alice,
        bob,
        bob_id,
        ..
    } = establish(&relay, &test_config()).await;

    alice.protocol.destroy();
    alice.session.closed().await.unwrap();

    // Sending fails locally, frames towards Alice are not processed anymore.
    assert!(matches!(
        alice.chat.send_message(&KeyId::random(), "x").await,
        Err(ChatError::UnknownConnection(_))
    ));
    let checkpoint = alice.protocol.checkpoint();
    bob.chat.send_message(&bob_id, "anyone there?").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.protocol.checkpoint(), checkpoint);
}

#[tokio::test]
async fn persisted_state_survives_restart() {
    setup_logging();
    let relay = MemoryRelay::new();
    let config = test_config();
    let Established {
        alice,
        bob,
        alice_id,
        bob_id,
        ..
    } = establish(&relay, &config).await;

    // Alice persists her state and shuts down.
    let storage = MemoryStorage::new();
    let store = EncryptedStore::open(storage.clone(), PASSWORD, &config)
        .await
        .unwrap();
    store
        .save(&StoreState {
            history: Vec::new(),
            connections: alice.chat.connections().await,
            published_keys: alice.chat.published_keys().await,
            checkpoint: alice.protocol.checkpoint(),
        })
        .await
        .unwrap();
    alice.protocol.destroy();
    alice.session.closed().await.unwrap();

    // Bob writes while Alice is offline.
    bob.chat.send_message(&bob_id, "while you were away").await.unwrap();

    // Alice restarts from the store, seeding her keys before connecting.
    let store = EncryptedStore::open(storage, PASSWORD, &config)
        .await
        .unwrap();
    let state = store.load().await.unwrap().unwrap();
    let mut alice = Peer::restored(&relay, &config, state).await;

    let ChatEvent::Message { id, text, .. } = alice.next_event().await else {
        panic!("expected message");
    };
    assert_eq!(id, alice_id);
    assert_eq!(text, "while you were away");

    // The restored session works in both directions.
    alice.chat.send_message(&alice_id, "back again").await.unwrap();
    let mut bob = bob;
    let ChatEvent::Message { text, .. } = bob.next_event().await else {
        panic!("expected message");
    };
    assert_eq!(text, "back again");
}

#[tokio::test]
async fn deleting_keys_and_connections() {
    let relay = MemoryRelay::new();
    let Established {
        mut alice,
        bob,
        alice_id,
        bob_id,
        ..
    } = establish(&relay, &test_config()).await;

    bob.chat.delete_connection(&bob_id).await.unwrap();
    assert!(bob.chat.connection(&bob_id).await.is_none());
    assert!(!bob.signs.has_key(&bob_id));

    let published_id = bob.chat.published_keys().await[0].id();
    bob.chat.delete_published_key(&published_id).await.unwrap();
    assert!(bob.keys.is_empty());

    // Requests to a deleted published key go nowhere.
    let stale_key: RsaPublicKey = {
        let (_, key) = bob.chat.issue_key("temporary").await.unwrap();
        let id = bob.chat.published_keys().await[0].id();
        bob.chat.delete_published_key(&id).await.unwrap();
        key
    };
    alice
        .chat
        .send_connection_request(&stale_key, "Alice")
        .await
        .unwrap();

    // Alice still has her side of the old connection plus the new request.
    assert_eq!(alice.chat.connections().await.len(), 2);
    assert!(alice.chat.connection(&alice_id).await.unwrap().is_established());
    assert!(alice.no_pending_events());
    assert!(matches!(
        bob.chat.delete_connection(&bob_id).await,
        Err(ChatError::UnknownConnection(_))
    ));
}

#[tokio::test]
async fn failed_accept_keeps_request_pending() {
    setup_logging();
    let relay = MemoryRelay::new();
    let config = test_config();
    let mut alice = Peer::new(&relay, &config).await;
    let mut bob = Peer::new(&relay, &config).await;
    let (_, published_key) = bob.chat.issue_key("Invite").await.unwrap();

    // A request which never reached the relay is forgotten.
    relay.set_online(false);
    assert!(matches!(
        alice
            .chat
            .send_connection_request(&published_key, "Alice")
            .await,
        Err(ChatError::Protocol(_))
    ));
    assert!(alice.chat.connections().await.is_empty());
    assert!(alice.keys.is_empty());
    relay.set_online(true);

    let alice_id = alice
        .chat
        .send_connection_request(&published_key, "Alice")
        .await
        .unwrap();
    let ChatEvent::NewPendingConnection { id: bob_id, .. } = bob.next_event().await else {
        panic!("expected pending connection");
    };

    // Accepting while the relay is unreachable leaves the request pending.
    relay.set_online(false);
    assert!(matches!(
        bob.chat.accept_connection(&bob_id).await,
        Err(ChatError::Protocol(_))
    ));
    assert!(bob.chat.connection(&bob_id).await.unwrap().is_pending());
    assert!(!bob.signs.has_key(&bob_id));
    assert!(matches!(
        bob.chat.decline_connection(&bob_id).await,
        Err(ChatError::Protocol(_))
    ));
    assert!(bob.chat.connection(&bob_id).await.unwrap().is_pending());

    // Retrying once the relay is back completes the handshake.
    relay.set_online(true);
    bob.chat.accept_connection(&bob_id).await.unwrap();
    assert!(matches!(
        bob.next_event().await,
        ChatEvent::ConnectionEstablished { id, .. } if id == bob_id
    ));
    assert!(matches!(
        alice.next_event().await,
        ChatEvent::ConnectionEstablished { id, .. } if id == alice_id
    ));
}

#[tokio::test]
async fn failed_confirmation_keeps_connection_requested() {
    let relay = MemoryRelay::new();
    let config = test_config();
    let alice = Peer::new(&relay, &config).await;

    // The other side is played by hand, reading the request straight from the relay.
    let invite = published_key("Invite");
    let alice_id = alice
        .chat
        .send_connection_request(invite.public_key(), "Alice")
        .await
        .unwrap();
    let keys = KeysIndex::new();
    invite.register(&keys);
    let frame = Frame::from_bytes(&relay.history()[0].payload).unwrap();
    let (_, plaintext) = keys.try_decrypt(&frame.ciphertext).await.unwrap();
    let ProtocolMessage::ConnectionRequest {
        from_name,
        ecdh_public_key,
        response_rsa_public_key,
    } = ProtocolMessage::from_bytes(&plaintext).unwrap()
    else {
        panic!("expected connection request");
    };
    let (_, accept, _) =
        ConnectionEntry::receive_request(&from_name, &ecdh_public_key, &response_rsa_public_key, 1)
            .unwrap()
            .accept(2)
            .unwrap();
    let event = ProtocolEvent::Message {
        key_id: alice_id,
        timestamp: 3,
        message: accept,
    };

    relay.set_online(false);
    assert!(matches!(
        alice.chat.handle_event(event.clone()).await,
        Err(ChatError::Protocol(_))
    ));
    assert!(alice.chat.connection(&alice_id).await.unwrap().is_requested());
    assert!(alice.keys.contains(&alice_id));
    assert!(!alice.signs.has_key(&alice_id));

    relay.set_online(true);
    alice.chat.handle_event(event).await.unwrap();
    assert!(
        alice
            .chat
            .connection(&alice_id)
            .await
            .unwrap()
            .is_pre_established()
    );
    assert!(alice.signs.has_key(&alice_id));
}

#[tokio::test]
async fn malformed_request_does_not_count_as_usage() {
    let relay = MemoryRelay::new();
    let bob = Peer::new(&relay, &test_config()).await;
    let (published_id, _) = bob.chat.issue_key("Invite").await.unwrap();

    let result = bob
        .chat
        .handle_event(ProtocolEvent::Message {
            key_id: published_id,
            timestamp: 1,
            message: ProtocolMessage::ConnectionRequest {
                from_name: "Mallory".into(),
                ecdh_public_key: vec![1, 2, 3],
                response_rsa_public_key: vec![4, 5, 6],
            },
        })
        .await;
    assert!(matches!(result, Err(ChatError::Connection(_))));
    assert_eq!(bob.chat.published_keys().await[0].usage_count(), 0);
    assert!(bob.chat.connections().await.is_empty());
}

#[tokio::test]
async fn autosaved_handshake_completes_after_restart() {
    setup_logging();
    let relay = MemoryRelay::new();
    let config = test_config();
    let alice_storage = MemoryStorage::new();
    let bob_storage = MemoryStorage::new();

    let alice = Peer::persistent(&relay, &config, &alice_storage).await;
    let mut bob = Peer::persistent(&relay, &config, &bob_storage).await;

    let (_, published_key) = bob.chat.issue_key("Invite").await.unwrap();
    let alice_id = alice
        .chat
        .send_connection_request(&published_key, "Alice")
        .await
        .unwrap();
    let ChatEvent::NewPendingConnection { id: bob_id, .. } = bob.next_event().await else {
        panic!("expected pending connection");
    };

    // Alice goes offline before the accept arrives, Bob shuts down right after accepting. Nobody
    // saves anything by hand.
    alice.shutdown().await;
    bob.chat.accept_connection(&bob_id).await.unwrap();
    bob.shutdown().await;

    let store = EncryptedStore::open(bob_storage.clone(), PASSWORD, &config)
        .await
        .unwrap();
    let saved = store.load().await.unwrap().unwrap();
    assert_eq!(saved.connections.len(), 1);
    assert!(saved.connections[0].is_pre_established());
    assert_eq!(saved.published_keys[0].usage_count(), 1);
    assert!(saved.checkpoint.is_some());

    // Both restart from their saved state. Alice catches up on the accept and the handshake
    // finishes.
    let mut bob = Peer::persistent(&relay, &config, &bob_storage).await;
    assert!(bob.chat.connection(&bob_id).await.unwrap().is_pre_established());
    let mut alice = Peer::persistent(&relay, &config, &alice_storage).await;

    assert!(matches!(
        alice.next_event().await,
        ChatEvent::ConnectionEstablished { id, .. } if id == alice_id
    ));
    assert!(matches!(
        bob.next_event().await,
        ChatEvent::ConnectionEstablished { id, .. } if id == bob_id
    ));

    alice.chat.send_message(&alice_id, "made it").await.unwrap();
    let ChatEvent::Message { text, .. } = bob.next_event().await else {
        panic!("expected message");
    };
    assert_eq!(text, "made it");
}

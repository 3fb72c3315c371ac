use super::*;
use crate::resolver::SharedFallback;
use crate::store::{AccountProfile, CredentialPair, Identity, RefreshPolicy};
use crate::vault::CredentialVault;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};

fn store_with_policy(policy: RefreshPolicy) -> Arc<IdentityStore> {
    let vault = CredentialVault::new(&BASE64.encode([0u8; 32])).unwrap();
    Arc::new(IdentityStore::open(":memory:", vault, policy).unwrap())
}

fn test_store() -> Arc<IdentityStore> {
    store_with_policy(RefreshPolicy::default())
}

fn register_identity(store: &IdentityStore, provider_user_id: &str) -> Identity {
    store
        .create_or_update_identity(&AccountProfile {
            provider_user_id: provider_user_id.to_string(),
            display_name: provider_user_id.to_string(),
        })
        .unwrap()
}

fn provider_for(server: &mockito::ServerGuard) -> ProviderConfig {
    ProviderConfig {
        authorize_url: format!("{}/authorize", server.url()),
        token_url: format!("{}/token", server.url()),
        profile_url: format!("{}/me", server.url()),
        scopes: vec!["library-read".to_string()],
        client_id: "client_id".to_string(),
        client_secret: "client_secret".to_string(),
        redirect_uri: "http://localhost:8001/auth/callback".to_string(),
    }
}

fn pair_expiring_in(access: &str, seconds: i64) -> CredentialPair {
    CredentialPair {
        access_secret: access.to_string(),
        refresh_secret: Some("refresh_secret".to_string()),
        expires_at: Some(Utc::now() + Duration::seconds(seconds)),
        granted_scopes: "library-read".to_string(),
    }
}

fn broker_with(
    store: Arc<IdentityStore>,
    provider: ProviderConfig,
    fallback: Option<SharedFallback>,
) -> CredentialBroker {
    let registry = Arc::new(AccountHandleRegistry::new(Arc::clone(&store)));
    let sessions = Arc::new(SessionTable::new(Arc::clone(&registry), 3600));
    let resolver = RequestIdentityResolver::standard(Arc::clone(&store), fallback);
    let factory = ThirdPartyClientFactory::new(Arc::clone(&store), provider);
    CredentialBroker::new(resolver, sessions, registry, factory, store)
}

fn keyed_request(identity: &Identity, session_key: &str) -> InboundRequest {
    InboundRequest {
        session_key: Some(session_key.to_string()),
        api_key: identity.api_key.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;

    #[tokio::test]
    async fn bearer_secret_rides_every_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/tracks")
            .match_header("authorization", "Bearer secret_token")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = ThirdPartyClient::new("idn_a".to_string(), "secret_token".to_string());
        let response = client
            .get(&format!("{}/v1/tracks", server.url()))
            .send()
            .await
            .unwrap();

        assert!(response.status().is_success());
        mock.assert_async().await;
    }

    #[test]
    fn debug_never_shows_the_secret() {
        let client = ThirdPartyClient::new("idn_a".to_string(), "secret_token".to_string());
        let debug = format!("{:?}", client);

        assert!(debug.contains("idn_a"));
        assert!(!debug.contains("secret_token"));
        assert!(debug.contains("<redacted>"));
    }
}

#[cfg(test)]
mod factory_tests {
    use super::*;

    #[tokio::test]
    async fn fresh_pair_served_without_refresh() {
        let server = mockito::Server::new_async().await;
        let store = test_store();
        let alice = register_identity(&store, "alice");
        store
            .save_credential(&alice.identity_id, &pair_expiring_in("current_access", 3600))
            .unwrap();

        let factory = ThirdPartyClientFactory::new(Arc::clone(&store), provider_for(&server));
        let client = factory.client_for(&alice.identity_id).await.unwrap();

        assert_eq!(client.credential_ref(), alice.identity_id);
        // No token mock was registered; reaching the provider would have failed
    }

    #[tokio::test]
    async fn expiring_pair_refreshed_and_persisted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"renewed_access","expires_in":3600}"#)
            .create_async()
            .await;

        let store = test_store();
        let alice = register_identity(&store, "alice");
        store
            .save_credential(&alice.identity_id, &pair_expiring_in("old_access", 30))
            .unwrap();

        let factory = ThirdPartyClientFactory::new(Arc::clone(&store), provider_for(&server));
        factory.client_for(&alice.identity_id).await.unwrap();

        let stored = store.load_credential(&alice.identity_id).unwrap().unwrap();
        assert_eq!(stored.access_secret, "renewed_access");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_pair_is_unauthenticated() {
        let server = mockito::Server::new_async().await;
        let store = test_store();
        let alice = register_identity(&store, "alice");

        let factory = ThirdPartyClientFactory::new(Arc::clone(&store), provider_for(&server));
        let result = factory.client_for(&alice.identity_id).await;

        assert!(matches!(result, Err(BrokerError::Unauthenticated)));
    }

    #[tokio::test]
    async fn failed_refresh_below_threshold_serves_stale_pair() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(500)
            .with_body("upstream down")
            .create_async()
            .await;

        // Threshold of 3: a single failure must not kill the grant
        let store = test_store();
        let alice = register_identity(&store, "alice");
        store
            .save_credential(&alice.identity_id, &pair_expiring_in("stale_access", 30))
            .unwrap();

        let factory = ThirdPartyClientFactory::new(Arc::clone(&store), provider_for(&server));
        let client = factory.client_for(&alice.identity_id).await.unwrap();

        assert_eq!(client.credential_ref(), alice.identity_id);
    }

    #[tokio::test]
    async fn failed_refresh_past_threshold_surfaces() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(500)
            .with_body("upstream down")
            .expect_at_least(1)
            .create_async()
            .await;

        let store = store_with_policy(RefreshPolicy {
            buffer_secs: 300,
            failure_threshold: 1,
        });
        let alice = register_identity(&store, "alice");
        store
            .save_credential(&alice.identity_id, &pair_expiring_in("stale_access", 30))
            .unwrap();

        let factory = ThirdPartyClientFactory::new(Arc::clone(&store), provider_for(&server));
        let result = factory.client_for(&alice.identity_id).await;

        assert!(matches!(result, Err(BrokerError::RefreshFailed)));
        assert!(store
            .get_identity(&alice.identity_id)
            .unwrap()
            .unwrap()
            .needs_reauth);
    }

    #[tokio::test]
    async fn unreadable_ciphertext_is_integrity_error() {
        let server = mockito::Server::new_async().await;
        let db = tempfile::NamedTempFile::new().unwrap();

        // Seal a pair under one key, then reopen the database under another
        let alice = {
            let vault = CredentialVault::new(&BASE64.encode([0u8; 32])).unwrap();
            let store = IdentityStore::open(db.path(), vault, RefreshPolicy::default()).unwrap();
            let alice = register_identity(&store, "alice");
            store
                .save_credential(&alice.identity_id, &pair_expiring_in("access", 3600))
                .unwrap();
            alice
        };

        let other_vault = CredentialVault::new(&BASE64.encode([7u8; 32])).unwrap();
        let store =
            Arc::new(IdentityStore::open(db.path(), other_vault, RefreshPolicy::default()).unwrap());
        let factory = ThirdPartyClientFactory::new(Arc::clone(&store), provider_for(&server));

        let result = factory.client_for(&alice.identity_id).await;
        assert!(matches!(result, Err(BrokerError::Integrity)));

        // The failure also flags the identity for re-auth
        assert!(store
            .get_identity(&alice.identity_id)
            .unwrap()
            .unwrap()
            .needs_reauth);
    }
}

#[cfg(test)]
mod resolve_client_tests {
    use super::*;

    #[tokio::test]
    async fn switched_account_drives_the_client() {
        let server = mockito::Server::new_async().await;
        let store = test_store();
        let alice = register_identity(&store, "alice");
        let sibling = register_identity(&store, "alice-alt");
        store
            .save_credential(&alice.identity_id, &pair_expiring_in("alice_access", 3600))
            .unwrap();
        store
            .save_credential(&sibling.identity_id, &pair_expiring_in("alt_access", 3600))
            .unwrap();

        let broker = broker_with(Arc::clone(&store), provider_for(&server), None);
        let request = keyed_request(&alice, "sess-1");

        // Register both accounts in the session, then switch to the sibling
        let primary = broker
            .registry()
            .register(&alice.identity_id, "primary", &alice.identity_id, true)
            .unwrap();
        let alt = broker
            .registry()
            .register(&alice.identity_id, "alt", &sibling.identity_id, false)
            .unwrap();
        broker.sessions().ensure_session("sess-1", &alice.identity_id);
        broker
            .sessions()
            .register_alias("sess-1", "primary", &primary.handle)
            .unwrap();
        broker
            .sessions()
            .register_alias("sess-1", "alt", &alt.handle)
            .unwrap();
        broker.sessions().switch("sess-1", "alt").unwrap();

        let client = broker.resolve_client(&request, None).await.unwrap();
        assert_eq!(client.credential_ref(), sibling.identity_id);
    }

    #[tokio::test]
    async fn explicit_name_is_one_shot() {
        let server = mockito::Server::new_async().await;
        let store = test_store();
        let alice = register_identity(&store, "alice");
        let sibling = register_identity(&store, "alice-alt");
        store
            .save_credential(&alice.identity_id, &pair_expiring_in("alice_access", 3600))
            .unwrap();
        store
            .save_credential(&sibling.identity_id, &pair_expiring_in("alt_access", 3600))
            .unwrap();

        let broker = broker_with(Arc::clone(&store), provider_for(&server), None);
        let request = keyed_request(&alice, "sess-1");

        let primary = broker
            .registry()
            .register(&alice.identity_id, "work", &alice.identity_id, true)
            .unwrap();
        let alt = broker
            .registry()
            .register(&alice.identity_id, "personal", &sibling.identity_id, false)
            .unwrap();
        broker.sessions().ensure_session("sess-1", &alice.identity_id);
        broker
            .sessions()
            .register_alias("sess-1", "work", &primary.handle)
            .unwrap();
        broker
            .sessions()
            .register_alias("sess-1", "personal", &alt.handle)
            .unwrap();
        broker.sessions().switch("sess-1", "work").unwrap();

        // One call on "personal" without switching
        let one_shot = broker
            .resolve_client(&request, Some("personal"))
            .await
            .unwrap();
        assert_eq!(one_shot.credential_ref(), sibling.identity_id);

        // The session's current account is untouched
        let after = broker.resolve_client(&request, None).await.unwrap();
        assert_eq!(after.credential_ref(), alice.identity_id);
    }

    #[tokio::test]
    async fn bare_session_falls_back_to_own_pair() {
        let server = mockito::Server::new_async().await;
        let store = test_store();
        let alice = register_identity(&store, "alice");
        store
            .save_credential(&alice.identity_id, &pair_expiring_in("alice_access", 3600))
            .unwrap();

        let broker = broker_with(Arc::clone(&store), provider_for(&server), None);

        // No aliases, no switch, not even a session key
        let request = InboundRequest {
            api_key: alice.api_key.clone(),
            ..Default::default()
        };

        let client = broker.resolve_client(&request, None).await.unwrap();
        assert_eq!(client.credential_ref(), alice.identity_id);
    }

    #[tokio::test]
    async fn explicit_unknown_name_still_fails() {
        let server = mockito::Server::new_async().await;
        let store = test_store();
        let alice = register_identity(&store, "alice");
        store
            .save_credential(&alice.identity_id, &pair_expiring_in("alice_access", 3600))
            .unwrap();

        let broker = broker_with(Arc::clone(&store), provider_for(&server), None);
        let request = keyed_request(&alice, "sess-1");

        let result = broker.resolve_client(&request, Some("nope")).await;
        assert!(matches!(
            result,
            Err(BrokerError::UnknownAccountName(name)) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn rotated_handle_in_alias_map_is_unauthorized() {
        let server = mockito::Server::new_async().await;
        let store = test_store();
        let alice = register_identity(&store, "alice");
        store
            .save_credential(&alice.identity_id, &pair_expiring_in("alice_access", 3600))
            .unwrap();

        let broker = broker_with(Arc::clone(&store), provider_for(&server), None);
        let request = keyed_request(&alice, "sess-1");

        let account = broker
            .registry()
            .register(&alice.identity_id, "work", &alice.identity_id, true)
            .unwrap();
        broker.sessions().ensure_session("sess-1", &alice.identity_id);
        broker
            .sessions()
            .register_alias("sess-1", "work", &account.handle)
            .unwrap();
        broker.sessions().switch("sess-1", "work").unwrap();

        // Rotation kills the aliased handle immediately
        broker
            .registry()
            .rotate(&alice.identity_id, &account.handle)
            .unwrap();

        let result = broker.resolve_client(&request, None).await;
        assert!(matches!(result, Err(BrokerError::Unauthorized)));
    }

    #[tokio::test]
    async fn two_identities_never_cross() {
        let server = mockito::Server::new_async().await;
        let store = test_store();
        let alice = register_identity(&store, "alice");
        let bob = register_identity(&store, "bob");
        store
            .save_credential(&alice.identity_id, &pair_expiring_in("alice_access", 3600))
            .unwrap();
        store
            .save_credential(&bob.identity_id, &pair_expiring_in("bob_access", 3600))
            .unwrap();

        let broker = Arc::new(broker_with(Arc::clone(&store), provider_for(&server), None));

        // Interleaved concurrent calls; each must get its own credential
        let mut tasks = Vec::new();
        for round in 0..4 {
            let broker = Arc::clone(&broker);
            let identity = if round % 2 == 0 { alice.clone() } else { bob.clone() };
            let session = format!("sess-{}", round);
            tasks.push(tokio::spawn(async move {
                let request = keyed_request(&identity, &session);
                let client = broker.resolve_client(&request, None).await.unwrap();
                (identity.identity_id.clone(), client.credential_ref().to_string())
            }));
        }

        for task in tasks {
            let (expected, resolved) = task.await.unwrap();
            assert_eq!(expected, resolved);
        }
    }

    #[tokio::test]
    async fn unauthenticated_request_is_rejected() {
        let server = mockito::Server::new_async().await;
        let broker = broker_with(test_store(), provider_for(&server), None);

        let result = broker.resolve_client(&InboundRequest::default(), None).await;
        assert!(matches!(result, Err(BrokerError::Unauthenticated)));
    }
}

#[cfg(test)]
mod from_config_tests {
    use super::*;
    use crate::config::{FallbackConfig, StagepassConfig};

    fn config_with_fallback(enabled: bool) -> StagepassConfig {
        StagepassConfig {
            fallback: FallbackConfig {
                enabled,
                lease_idle_secs: 60,
            },
            ..StagepassConfig::default()
        }
    }

    fn broker_from(
        store: &Arc<IdentityStore>,
        server: &mockito::ServerGuard,
        config: &StagepassConfig,
    ) -> CredentialBroker {
        let registry = Arc::new(AccountHandleRegistry::new(Arc::clone(store)));
        CredentialBroker::from_config(Arc::clone(store), registry, provider_for(server), config)
    }

    /// The `[fallback]` flag decides whether the shared-token step exists at
    /// all; the environment token alone must not enable it.
    #[tokio::test]
    async fn fallback_flag_gates_the_chain() {
        let server = mockito::Server::new_async().await;
        let store = test_store();
        let carol = register_identity(&store, "carol");
        store
            .save_credential(&carol.identity_id, &pair_expiring_in("carol_access", 3600))
            .unwrap();
        std::env::set_var("STAGEPASS_FALLBACK_TOKEN", carol.api_key.clone().unwrap());

        let headerless = InboundRequest {
            session_key: Some("legacy".to_string()),
            ..Default::default()
        };

        // Disabled: the step is absent from the chain, not merely inert
        let disabled = broker_from(&store, &server, &config_with_fallback(false));
        let refused = disabled.resolve_client(&headerless, None).await;
        assert!(matches!(refused, Err(BrokerError::Unauthenticated)));

        // Enabled under the same environment: headerless requests resolve
        let enabled = broker_from(&store, &server, &config_with_fallback(true));
        let client = enabled.resolve_client(&headerless, None).await.unwrap();
        assert_eq!(client.credential_ref(), carol.identity_id);

        std::env::remove_var("STAGEPASS_FALLBACK_TOKEN");
    }
}

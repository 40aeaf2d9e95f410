use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{Value, json};

use gatehouse_api::app::{AppState, build_app};
use gatehouse_auth::Hs256TokenCodec;
use gatehouse_infra::seed;
use gatehouse_infra::{AuthService, AuthSettings, BootstrapAdmin, InMemoryAuthStore, OutboxNotifier};

const ADMIN_EMAIL: &str = "admin@example.com";
const ADMIN_PASSWORD: &str = "admin-password";

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    store: Arc<InMemoryAuthStore>,
    outbox: Arc<OutboxNotifier>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let store = Arc::new(InMemoryAuthStore::new());
        seed::seed_catalog(store.as_ref()).await.unwrap();

        let outbox = Arc::new(OutboxNotifier::new());
        let auth = Arc::new(AuthService::new(
            store.clone(),
            Arc::new(Hs256TokenCodec::new(b"black-box-secret")),
            outbox.clone(),
            AuthSettings {
                bcrypt_cost: 4,
                ..AuthSettings::default()
            },
        ));
        let admin = BootstrapAdmin {
            email: ADMIN_EMAIL.to_string(),
            password: ADMIN_PASSWORD.to_string(),
        };
        seed::bootstrap_admin(&auth, &admin).await.unwrap();

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(AppState::new(auth).with_secure_cookies(false));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            client: reqwest::Client::new(),
            store,
            outbox,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn login(&self, email: &str, password: &str) -> reqwest::Response {
        self.client
            .post(self.url("/auth/login"))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await
            .unwrap()
    }

    async fn token(&self, email: &str, password: &str) -> String {
        let res = self.login(email, password).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = res.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    async fn get(&self, path: &str, token: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
    }

    /// Registers a user through the admin API and returns its id.
    async fn create_user(&self, admin_token: &str, email: &str, password: &str) -> String {
        let res = self
            .client
            .post(self.url("/admin/users"))
            .bearer_auth(admin_token)
            .json(&json!({ "email": email, "name": "Test User", "password": password }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let body: Value = res.json().await.unwrap();
        body["id"].as_str().unwrap().to_string()
    }

    async fn reset_link_for(&self, email: &str) -> String {
        // Delivery runs on a spawned task.
        for _ in 0..200 {
            if let Some(notice) = self.outbox.last_to(email) {
                return notice.reset_link;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("no reset link delivered to {email}");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn health_is_public() {
    let server = TestServer::spawn().await;
    let res = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn login_sets_cookie_and_token_resolves_identity() {
    let server = TestServer::spawn().await;

    let res = server.login("Admin@Example.com ", ADMIN_PASSWORD).await;
    assert_eq!(res.status(), StatusCode::OK);
    let cookie = res
        .headers()
        .get(reqwest::header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("gatehouse_token="));
    assert!(cookie.contains("HttpOnly"));

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["user"]["email"], ADMIN_EMAIL);
    let token = body["token"].as_str().unwrap();

    let me: Value = server.get("/me", token).await.json().await.unwrap();
    assert_eq!(me["user"]["email"], ADMIN_EMAIL);
    assert!(me["user"]["permissions"].as_array().unwrap().len() > 1);

    // The cookie alone is accepted too.
    let pair = cookie.split(';').next().unwrap();
    let res = server
        .client
        .get(server.url("/me"))
        .header(reqwest::header::COOKIE, pair)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn failed_logins_look_the_same() {
    let server = TestServer::spawn().await;

    let wrong_password = server.login(ADMIN_EMAIL, "not-the-password").await;
    let unknown_email = server.login("nobody@example.com", "not-the-password").await;
    assert_eq!(wrong_password.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(unknown_email.status(), StatusCode::UNAUTHORIZED);

    let a: Value = wrong_password.json().await.unwrap();
    let b: Value = unknown_email.json().await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a["error"], "invalid_credentials");
}

#[tokio::test]
async fn guards_distinguish_unauthenticated_from_forbidden() {
    let server = TestServer::spawn().await;
    let admin = server.token(ADMIN_EMAIL, ADMIN_PASSWORD).await;
    let user_id = server.create_user(&admin, "plain@example.com", "plain-password").await;
    let plain = server.token("plain@example.com", "plain-password").await;

    let res = server.client.get(server.url("/me")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unauthenticated");

    let res = server.get("/admin/roles", "garbage.token.value").await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = server.get("/admin/roles", &plain).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "forbidden");
    assert_eq!(body["required"], json!(["role:read"]));

    let res = server
        .get(&format!("/admin/users/{user_id}/permissions"), &plain)
        .await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["missing"], json!(["user:read", "role:read"]));

    // A signed-in user may always read their own server-side permissions.
    let res = server.get("/me/permissions", &plain).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["permissions"], json!([]));
}

#[tokio::test]
async fn logout_revokes_and_is_idempotent() {
    let server = TestServer::spawn().await;
    let token = server.token(ADMIN_EMAIL, ADMIN_PASSWORD).await;
    assert_eq!(server.get("/me", &token).await.status(), StatusCode::OK);

    for _ in 0..2 {
        let res = server
            .client
            .post(server.url("/auth/logout"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let cookie = res.headers().get(reqwest::header::SET_COOKIE).unwrap();
        assert!(cookie.to_str().unwrap().contains("Max-Age=0"));
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["ok"], true);
    }

    assert_eq!(server.get("/me", &token).await.status(), StatusCode::UNAUTHORIZED);

    let res = server.client.post(server.url("/auth/logout")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn public_auth_routes_survive_a_store_outage() {
    let server = TestServer::spawn().await;
    let token = server.token(ADMIN_EMAIL, ADMIN_PASSWORD).await;
    server.store.set_unavailable(true);

    let res = server
        .client
        .post(server.url("/auth/logout"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let cookie = res.headers().get(reqwest::header::SET_COOKIE).unwrap();
    assert!(cookie.to_str().unwrap().starts_with("gatehouse_token=;"));
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["ok"], true);

    let res = server
        .client
        .post(server.url("/auth/password-reset/request"))
        .bearer_auth(&token)
        .json(&json!({ "email": ADMIN_EMAIL }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Guarded routes report the outage instead of a misleading 401.
    assert_eq!(
        server.get("/me", &token).await.status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );

    server.store.set_unavailable(false);
    assert_eq!(server.get("/me", &token).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn password_reset_revokes_every_session() {
    let server = TestServer::spawn().await;
    let admin = server.token(ADMIN_EMAIL, ADMIN_PASSWORD).await;
    server.create_user(&admin, "alice@example.com", "old-password").await;
    let laptop = server.token("alice@example.com", "old-password").await;
    let phone = server.token("alice@example.com", "old-password").await;

    let sessions: Value = server.get("/me/sessions", &laptop).await.json().await.unwrap();
    let sessions = sessions["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions.iter().filter(|s| s["current"] == true).count(), 1);

    let res = server
        .client
        .post(server.url("/auth/password-reset/request"))
        .json(&json!({ "email": "alice@example.com" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let link = server.reset_link_for("alice@example.com").await;
    let raw = link.split("token=").nth(1).unwrap().to_string();

    let complete = |password: &'static str| {
        let raw = raw.clone();
        let client = server.client.clone();
        let url = server.url("/auth/password-reset/complete");
        async move {
            client
                .post(url)
                .json(&json!({ "token": raw, "password": password }))
                .send()
                .await
                .unwrap()
        }
    };

    let res = complete("new-password").await;
    assert_eq!(res.status(), StatusCode::OK);

    assert_eq!(server.get("/me", &laptop).await.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(server.get("/me", &phone).await.status(), StatusCode::UNAUTHORIZED);

    // Single use.
    let res = complete("another-password").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid");

    assert_eq!(
        server.login("alice@example.com", "old-password").await.status(),
        StatusCode::UNAUTHORIZED
    );
    server.token("alice@example.com", "new-password").await;
}

#[tokio::test]
async fn reset_request_does_not_reveal_registration() {
    let server = TestServer::spawn().await;

    let mut bodies = Vec::new();
    for email in [ADMIN_EMAIL, "ghost@example.com"] {
        let res = server
            .client
            .post(server.url("/auth/password-reset/request"))
            .json(&json!({ "email": email }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        bodies.push(res.text().await.unwrap());
    }
    assert_eq!(bodies[0], bodies[1]);

    server.reset_link_for(ADMIN_EMAIL).await;
    assert!(server.outbox.last_to("ghost@example.com").is_none());
}

#[tokio::test]
async fn role_lifecycle_through_admin_api() {
    let server = TestServer::spawn().await;
    let admin = server.token(ADMIN_EMAIL, ADMIN_PASSWORD).await;
    let user_id = server.create_user(&admin, "bob@example.com", "bob-password").await;
    let bob = server.token("bob@example.com", "bob-password").await;

    let res = server
        .client
        .post(server.url("/admin/roles"))
        .bearer_auth(&admin)
        .json(&json!({ "name": "auditor" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let role: Value = res.json().await.unwrap();
    let role_id = role["id"].as_str().unwrap().to_string();

    let res = server
        .client
        .put(server.url(&format!("/admin/roles/{role_id}/permissions/audit:read")))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = server
        .client
        .put(server.url(&format!("/admin/roles/{role_id}/permissions/not:catalogued")))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let assign = || {
        server
            .client
            .post(server.url(&format!("/admin/users/{user_id}/roles")))
            .bearer_auth(&admin)
            .json(&json!({ "roleId": role_id }))
            .send()
    };
    let first = assign().await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let second = assign().await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["assigned"], false);

    // Bob's existing token sees the grant on the next request.
    let perms: Value = server.get("/me/permissions", &bob).await.json().await.unwrap();
    assert_eq!(perms["permissions"], json!(["audit:read"]));

    let admin_view: Value = server
        .get(&format!("/admin/users/{user_id}/permissions"), &admin)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(admin_view["permissions"], json!(["audit:read"]));

    let delete_role = || {
        server
            .client
            .delete(server.url(&format!("/admin/roles/{role_id}")))
            .bearer_auth(&admin)
            .send()
    };
    let res = delete_role().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = server
        .client
        .delete(server.url(&format!("/admin/users/{user_id}/roles/{role_id}")))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    assert_eq!(delete_role().await.unwrap().status(), StatusCode::NO_CONTENT);
    let perms: Value = server.get("/me/permissions", &bob).await.json().await.unwrap();
    assert_eq!(perms["permissions"], json!([]));
}

#[tokio::test]
async fn admin_can_end_all_sessions_of_a_user() {
    let server = TestServer::spawn().await;
    let admin = server.token(ADMIN_EMAIL, ADMIN_PASSWORD).await;
    let user_id = server.create_user(&admin, "carol@example.com", "carol-password").await;
    let carol = server.token("carol@example.com", "carol-password").await;

    let res = server
        .client
        .delete(server.url(&format!("/admin/users/{user_id}/sessions")))
        .bearer_auth(&carol)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = server
        .client
        .delete(server.url(&format!("/admin/users/{user_id}/sessions")))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["revoked"], 1);

    assert_eq!(server.get("/me", &carol).await.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(server.get("/me", &admin).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn invalid_ids_are_rejected() {
    let server = TestServer::spawn().await;
    let admin = server.token(ADMIN_EMAIL, ADMIN_PASSWORD).await;

    let res = server
        .client
        .delete(server.url("/admin/roles/not-a-uuid"))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_id");
}

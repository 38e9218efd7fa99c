//! Concurrency property: for N concurrent charges of cost `c` against a
//! balance `B`, exactly `floor(B / c)` succeed and the rest fail with
//! insufficient credits. The account never goes negative.

use credit_meter::{ChargeCommand, ChargeOutcome, SqliteStore};

const WINDOW_MS: i64 = 30 * 24 * 60 * 60 * 1000;

fn charge(user_id: &str, credits: i64) -> ChargeCommand {
    ChargeCommand {
        user_id: user_id.to_string(),
        credits,
        description: "chat via openai".to_string(),
        metadata: serde_json::json!({"operation": "chat"}),
        model: "openai:chat".to_string(),
        input_tokens: 10,
        output_tokens: 10,
        was_free: false,
    }
}

async fn drained_account(store: &SqliteStore, user_id: &str, balance: i64) {
    // Bootstrap equals the allowance, and a first charge pins the reset
    // window so concurrent charges below race on the balance alone.
    store
        .ensure_account(user_id, balance + 1, balance + 1, 1_000)
        .await
        .expect("account");
    let outcome = store
        .charge_atomic(charge(user_id, 1), 2_000, WINDOW_MS)
        .await
        .expect("pin reset");
    assert_eq!(
        outcome,
        ChargeOutcome::Charged {
            balance_after: balance
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_charges_never_overspend() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("credits.sqlite"));
    store.init().await.expect("init");
    drained_account(&store, "u1", 10).await;

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .charge_atomic(charge("u1", 1), 3_000, WINDOW_MS)
                .await
                .expect("charge")
        }));
    }

    let mut charged = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.expect("join") {
            ChargeOutcome::Charged { balance_after } => {
                assert!(balance_after >= 0);
                charged += 1;
            }
            ChargeOutcome::InsufficientCredits { balance } => {
                assert!(balance >= 0);
                refused += 1;
            }
        }
    }

    assert_eq!(charged, 10);
    assert_eq!(refused, 10);

    let account = store.account("u1").await.expect("read").expect("row");
    assert_eq!(account.messages_remaining, 0);
    assert_eq!(account.total_used, 11);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_charges_with_larger_cost() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("credits.sqlite"));
    store.init().await.expect("init");
    drained_account(&store, "u1", 10).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .charge_atomic(charge("u1", 3), 3_000, WINDOW_MS)
                .await
                .expect("charge")
        }));
    }

    let charged = {
        let mut charged = 0;
        for task in tasks {
            if task.await.expect("join").is_charged() {
                charged += 1;
            }
        }
        charged
    };

    // floor(10 / 3)
    assert_eq!(charged, 3);
    let account = store.account("u1").await.expect("read").expect("row");
    assert_eq!(account.messages_remaining, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn users_do_not_contend_with_each_other() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("credits.sqlite"));
    store.init().await.expect("init");
    drained_account(&store, "u1", 5).await;
    drained_account(&store, "u2", 5).await;

    let mut tasks = Vec::new();
    for user in ["u1", "u2"] {
        for _ in 0..5 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .charge_atomic(charge(user, 1), 3_000, WINDOW_MS)
                    .await
                    .expect("charge")
            }));
        }
    }
    for task in tasks {
        assert!(task.await.expect("join").is_charged());
    }

    for user in ["u1", "u2"] {
        let account = store.account(user).await.expect("read").expect("row");
        assert_eq!(account.messages_remaining, 0);
    }
}

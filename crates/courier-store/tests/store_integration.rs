//! Storage integration: schema, repositories, ledger invariant, and
//! write-behind batch application against an in-memory database.

use std::str::FromStr;

use chrono::Utc;

use courier_cache::{QueuedWrite, WriteKind};
use courier_core::{TokenUsage, Usd};
use courier_store::models::*;
use courier_store::repo::{balance_ops, chats, messages, threads, tool_calls, users};
use courier_store::{flush, Database};

#[tokio::test]
async fn thread_get_or_create_is_stable() {
    let db = Database::open_in_memory().unwrap();
    db.with_conn(|conn| {
        users::upsert(conn, &User::new(7, "claude-sonnet-4-5"))?;
        chats::upsert(
            conn,
            &Chat {
                chat_id: -100,
                kind: ChatKind::Supergroup,
                is_forum: true,
            },
        )
    })
    .await
    .unwrap();

    let first = db
        .with_conn(|conn| threads::get_or_create(conn, -100, 7, 5))
        .await
        .unwrap();
    let second = db
        .with_conn(|conn| threads::get_or_create(conn, -100, 7, 5))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert!(first.needs_topic_naming);

    // A different topic gets its own thread.
    let other = db
        .with_conn(|conn| threads::get_or_create(conn, -100, 7, 6))
        .await
        .unwrap();
    assert_ne!(first.id, other.id);
}

#[tokio::test]
async fn message_upsert_is_idempotent() {
    let db = Database::open_in_memory().unwrap();
    db.with_conn(|conn| {
        users::upsert(conn, &User::new(1, "claude-sonnet-4-5"))?;
        chats::upsert(
            conn,
            &Chat {
                chat_id: 10,
                kind: ChatKind::Private,
                is_forum: false,
            },
        )?;
        threads::get_or_create(conn, 10, 1, 0).map(|_| ())
    })
    .await
    .unwrap();

    let msg = StoredMessage {
        chat_id: 10,
        message_id: 555,
        thread_id: 1,
        role: Role::Assistant,
        text: "Hello!".into(),
        attachments: vec![],
        usage: TokenUsage {
            input: 100,
            output: 20,
            ..Default::default()
        },
        thinking_json: Some(serde_json::json!([{"type": "thinking", "thinking": "hm", "signature": "sig=="}])),
        edit_count: 0,
        created_at: Utc::now(),
    };

    for _ in 0..2 {
        let m = msg.clone();
        db.with_conn(move |conn| messages::upsert(conn, &m)).await.unwrap();
    }

    let count = db
        .with_conn(|conn| messages::count_for_thread(conn, 1))
        .await
        .unwrap();
    assert_eq!(count, 1);

    let stored = db
        .with_conn(|conn| messages::get(conn, 10, 555))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.role, Role::Assistant);
    // Thinking blocks come back byte-for-byte equal as JSON values.
    assert_eq!(stored.thinking_json, msg.thinking_json);
}

#[tokio::test]
async fn ledger_rows_replay_to_balance() {
    let db = Database::open_in_memory().unwrap();
    db.with_conn(|conn| users::upsert(conn, &User::new(9, "claude-sonnet-4-5")))
        .await
        .unwrap();

    // Apply a credit then two charges by hand, the way the flush applier does.
    let entries = [
        ("1.0000", BalanceOpKind::Payment),
        ("-0.2500", BalanceOpKind::Usage),
        ("-0.0500", BalanceOpKind::Usage),
    ];
    let mut balance = Usd::ZERO;
    for (i, (amount, kind)) in entries.iter().enumerate() {
        let amount = Usd::from_str(amount).unwrap();
        let before = balance;
        balance = before + amount;
        let op = BalanceOperation {
            id: format!("op-{i}"),
            user_id: 9,
            kind: *kind,
            amount,
            balance_before: before,
            balance_after: balance,
            related_payment: None,
            related_message_id: None,
            admin_user_id: None,
            description: "test".into(),
            created_at: Utc::now(),
        };
        db.with_conn(move |conn| {
            balance_ops::insert(conn, &op)?;
            users::set_balance(conn, 9, op.balance_after)
        })
        .await
        .unwrap();
    }

    let replayed = db
        .with_conn(|conn| balance_ops::replay_balance(conn, 9))
        .await
        .unwrap();
    assert_eq!(replayed, Usd::from_str("0.7000").unwrap());

    let user = db
        .with_conn(|conn| users::get(conn, 9))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user.balance, replayed);

    let ops = db
        .with_conn(|conn| balance_ops::for_user_chronological(conn, 9))
        .await
        .unwrap();
    assert!(ops.iter().all(|op| op.is_consistent()));
}

#[tokio::test]
async fn apply_batch_round_trips_payloads() {
    let db = Database::open_in_memory().unwrap();
    db.with_conn(|conn| {
        users::upsert(conn, &User::new(3, "claude-sonnet-4-5"))?;
        chats::upsert(
            conn,
            &Chat {
                chat_id: 20,
                kind: ChatKind::Private,
                is_forum: false,
            },
        )?;
        threads::get_or_create(conn, 20, 3, 0).map(|_| ())
    })
    .await
    .unwrap();

    let msg = StoredMessage {
        chat_id: 20,
        message_id: 1,
        thread_id: 1,
        role: Role::User,
        text: "What is 2+2?".into(),
        attachments: vec![],
        usage: TokenUsage::default(),
        thinking_json: None,
        edit_count: 0,
        created_at: Utc::now(),
    };
    let call = ToolCallRecord {
        id: "call-1".into(),
        user_id: 3,
        chat_id: 20,
        thread_id: Some(1),
        message_id: Some(1),
        tool_name: "execute_python".into(),
        model_id: "claude-sonnet-4-5".into(),
        usage: TokenUsage::default(),
        cost: Usd::from_str("0.0010").unwrap(),
        duration_ms: 412,
        success: true,
        error: None,
        created_at: Utc::now(),
    };

    let writes = vec![
        QueuedWrite {
            kind: WriteKind::Message,
            data: serde_json::to_value(&msg).unwrap(),
            queued_at: Utc::now().timestamp(),
            retry_count: None,
            retry_after: None,
        },
        QueuedWrite {
            kind: WriteKind::ToolCall,
            data: serde_json::to_value(&call).unwrap(),
            queued_at: Utc::now().timestamp(),
            retry_count: None,
            retry_after: None,
        },
        QueuedWrite {
            kind: WriteKind::UserStats,
            data: serde_json::json!({"user_id": 3, "messages_delta": 1, "tokens_delta": 120}),
            queued_at: Utc::now().timestamp(),
            retry_count: None,
            retry_after: None,
        },
    ];

    let applied = flush::apply_batch(&db, writes.clone()).await.unwrap();
    assert_eq!(applied, 3);

    // Replaying the same batch is harmless (upserts / DO NOTHING).
    flush::apply_batch(&db, writes).await.unwrap();

    let stored = db
        .with_conn(|conn| messages::get(conn, 20, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.text, "What is 2+2?");

    let stored_call = db
        .with_conn(|conn| tool_calls::get(conn, "call-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored_call.tool_name, "execute_python");
    assert_eq!(stored_call.cost, Usd::from_str("0.0010").unwrap());
}

#[tokio::test]
async fn malformed_write_is_skipped_not_fatal() {
    let db = Database::open_in_memory().unwrap();
    let writes = vec![QueuedWrite {
        kind: WriteKind::Message,
        data: serde_json::json!({"nonsense": true}),
        queued_at: Utc::now().timestamp(),
        retry_count: None,
        retry_after: None,
    }];
    let applied = flush::apply_batch(&db, writes).await.unwrap();
    assert_eq!(applied, 0);
}

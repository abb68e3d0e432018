use super::*;
use proptest::prelude::*;
use shared::error::ErrorCode;

fn at(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000 + ms).expect("timestamp")
}

fn post(id: &str, channel: &str, ms: i64) -> Post {
    Post {
        id: PostKey::Confirmed(PostId::from(id)),
        pending_post_id: None,
        channel_id: ChannelId::from(channel),
        root_id: None,
        user_id: UserId::from("bob"),
        created_at: at(ms),
        updated_at: at(ms),
        deleted_at: None,
        message: format!("message {id}"),
        post_type: String::new(),
        file_ids: Vec::new(),
        reactions: Default::default(),
        reply_count: 0,
    }
}

fn reply(id: &str, channel: &str, root: &str, ms: i64) -> Post {
    Post {
        root_id: Some(PostId::from(root)),
        ..post(id, channel, ms)
    }
}

fn draft(temp: &str, channel: &str, root: Option<&str>, ms: i64) -> PostDraft {
    PostDraft {
        temp_id: TempId::from(temp),
        channel_id: ChannelId::from(channel),
        root_id: root.map(PostId::from),
        user_id: UserId::from("alice"),
        message: "draft".to_string(),
        file_ids: vec![FileId::from("f1"), FileId::from("f1")],
        created_at: at(ms),
    }
}

fn ids(posts: &[Post]) -> Vec<String> {
    posts.iter().map(|post| post.id.as_str().to_string()).collect()
}

fn c1() -> ChannelId {
    ChannelId::from("c1")
}

fn key(id: &str) -> PostKey {
    PostKey::Confirmed(PostId::from(id))
}

fn load_thread(store: &mut PostStore, root: Post, replies: Vec<Post>) {
    let root_id = root.confirmed_id().cloned().expect("root id");
    store.begin_thread_load(&root_id);
    let mut posts = vec![root];
    posts.extend(replies);
    store.complete_thread_load(&root_id, Page { posts, has_more: false });
}

#[test]
fn pages_merge_in_order_and_redelivery_is_a_no_op() {
    let mut store = PostStore::new();
    let page = vec![post("p2", "c1", 20), post("p1", "c1", 10)];

    assert_eq!(store.append_older(&c1(), page.clone(), true), Mutation::Applied);
    assert_eq!(ids(&store.channel_posts(&c1())), vec!["p1", "p2"]);
    assert_eq!(store.append_older(&c1(), page, true), Mutation::Unchanged);

    assert_eq!(store.receive_post(post("p3", "c1", 30)), Mutation::Applied);
    assert_eq!(store.receive_post(post("p3", "c1", 30)), Mutation::Unchanged);
    assert_eq!(ids(&store.channel_posts(&c1())), vec!["p1", "p2", "p3"]);

    assert_eq!(store.oldest_post_id(&c1()), Some(PostId::from("p1")));
    assert_eq!(store.newest_post_id(&c1()), Some(PostId::from("p3")));
}

#[test]
fn page_flags_are_tracked_per_direction() {
    let mut store = PostStore::new();
    assert!(store.pagination(&c1()).has_more_older);

    store.append_older(&c1(), vec![post("p1", "c1", 10)], false);
    store.append_newer(&c1(), vec![post("p2", "c1", 20)], true);
    store.set_pagination_error(&c1(), ApiError::unavailable("offline"));

    let state = store.pagination(&c1());
    assert!(!state.has_more_older);
    assert!(state.has_more_newer);
    assert_eq!(state.error.map(|err| err.code), Some(ErrorCode::Unavailable));

    store.append_newer(&c1(), Vec::new(), false);
    assert_eq!(store.pagination(&c1()).error, None);
}

#[test]
fn page_entries_from_other_channels_are_skipped() {
    let mut store = PostStore::new();
    store.append_older(&c1(), vec![post("p1", "c1", 10), post("x1", "c2", 5)], true);
    assert_eq!(ids(&store.channel_posts(&c1())), vec!["p1"]);
    assert!(store.post(&key("x1")).is_none());
}

#[test]
fn confirmation_repositions_by_server_timestamp() {
    let mut store = PostStore::new();
    store.append_older(&c1(), vec![post("p1", "c1", 10), post("p2", "c1", 20)], true);

    let (handle, mutation) = store.create_optimistic(draft("t3", "c1", None, 21));
    assert_eq!(mutation, Mutation::Applied);
    assert_eq!(ids(&store.channel_posts(&c1())), vec!["p1", "p2", "t3"]);
    let provisional = store.find_post(&handle.temp_id).expect("provisional");
    assert!(provisional.is_pending());
    assert_eq!(provisional.file_ids, vec![FileId::from("f1")]);

    let mut server = post("p3", "c1", 19);
    server.pending_post_id = Some(TempId::from("t3"));
    assert_eq!(store.confirm_create(&handle.temp_id, server), Ok(Mutation::Applied));

    assert_eq!(ids(&store.channel_posts(&c1())), vec!["p1", "p3", "p2"]);
    assert!(store.post(&PostKey::Pending(TempId::from("t3"))).is_none());
    assert_eq!(
        store.find_post(&TempId::from("t3")).and_then(Post::confirmed_id),
        Some(&PostId::from("p3"))
    );
}

#[test]
fn provisional_timestamp_is_nudged_past_the_tail() {
    let mut store = PostStore::new();
    store.append_older(&c1(), vec![post("p2", "c1", 20)], true);

    store.create_optimistic(draft("t1", "c1", None, 5));

    let provisional = store.find_post(&TempId::from("t1")).expect("provisional");
    assert_eq!(provisional.created_at, at(21));
    assert_eq!(ids(&store.channel_posts(&c1())), vec!["p2", "t1"]);
}

#[test]
fn push_before_rest_response_yields_a_single_entry() {
    let mut store = PostStore::new();
    let (handle, _) = store.create_optimistic(draft("t1", "c1", None, 10));

    let mut pushed = post("p1", "c1", 10);
    pushed.pending_post_id = Some(handle.temp_id.clone());
    assert_eq!(store.receive_post(pushed.clone()), Mutation::Applied);
    assert_eq!(ids(&store.channel_posts(&c1())), vec!["p1"]);

    assert_eq!(store.confirm_create(&handle.temp_id, pushed), Ok(Mutation::Unchanged));
    assert_eq!(ids(&store.channel_posts(&c1())), vec!["p1"]);
}

#[test]
fn uncorrelated_push_of_a_reply_is_not_double_counted() {
    let mut store = PostStore::new();
    load_thread(&mut store, post("root", "c1", 1), Vec::new());

    store.create_optimistic(draft("t1", "c1", Some("root"), 10));
    assert_eq!(store.post(&key("root")).map(|root| root.reply_count), Some(1));

    store.receive_post(reply("r1", "c1", "root", 10));
    assert_eq!(store.post(&key("root")).map(|root| root.reply_count), Some(2));

    let mut server = reply("r1", "c1", "root", 10);
    server.pending_post_id = Some(TempId::from("t1"));
    store
        .confirm_create(&TempId::from("t1"), server)
        .expect("confirmed");

    assert_eq!(store.post(&key("root")).map(|root| root.reply_count), Some(1));
    let view = store.thread(&PostId::from("root")).expect("thread");
    assert_eq!(ids(&view.posts), vec!["root", "r1"]);
}

#[test]
fn confirmation_must_carry_a_server_id() {
    let mut store = PostStore::new();
    store.create_optimistic(draft("t1", "c1", None, 10));
    let mut bogus = post("ignored", "c1", 10);
    bogus.id = PostKey::Pending(TempId::from("t1"));

    let err = store
        .confirm_create(&TempId::from("t1"), bogus)
        .expect_err("rejected");
    assert!(matches!(err, SyncError::Validation(_)));
    assert!(store.find_post(&TempId::from("t1")).is_some());
}

#[test]
fn failed_create_removes_provisional_and_reply_count() {
    let mut store = PostStore::new();
    load_thread(&mut store, post("root", "c1", 1), Vec::new());
    let (handle, _) = store.create_optimistic(draft("t1", "c1", Some("root"), 10));

    assert_eq!(store.fail_create(&handle.temp_id), Mutation::Applied);
    assert_eq!(store.fail_create(&handle.temp_id), Mutation::Unchanged);
    assert!(store.channel_posts(&c1()).is_empty());
    assert_eq!(store.post(&key("root")).map(|root| root.reply_count), Some(0));
    let view = store.thread(&PostId::from("root")).expect("thread");
    assert_eq!(ids(&view.posts), vec!["root"]);
}

#[test]
fn edits_respect_update_time_and_presence() {
    let mut store = PostStore::new();
    store.receive_post(post("p1", "c1", 10));
    let p1 = PostId::from("p1");

    assert_eq!(
        store.apply_edit(&p1, "edited", vec![FileId::from("f2")], at(20)),
        Ok(Mutation::Applied)
    );
    assert_eq!(store.apply_edit(&p1, "older", Vec::new(), at(15)), Ok(Mutation::Unchanged));
    assert_eq!(store.post(&key("p1")).map(|p| p.message.as_str()), Some("edited"));

    let err = store
        .apply_edit(&PostId::from("missing"), "x", Vec::new(), at(30))
        .expect_err("unknown");
    assert!(err.is_conflict());

    store.apply_delete(&p1, at(40)).expect("deleted");
    let err = store.apply_edit(&p1, "zombie", Vec::new(), at(50)).expect_err("deleted");
    assert!(err.is_conflict());
}

#[test]
fn deleted_post_is_never_resurrected() {
    let mut store = PostStore::new();
    store.append_older(&c1(), vec![post("p1", "c1", 10), post("p2", "c1", 20)], true);
    let p1 = PostId::from("p1");

    assert_eq!(store.apply_delete(&p1, at(30)), Ok(Mutation::Applied));
    assert_eq!(store.apply_delete(&p1, at(31)), Ok(Mutation::Unchanged));
    assert_eq!(ids(&store.channel_posts(&c1())), vec!["p2"]);

    let tombstone = store.post(&key("p1")).expect("tombstone");
    assert!(tombstone.is_deleted());
    assert!(tombstone.message.is_empty());

    assert_eq!(store.receive_post(post("p1", "c1", 10)), Mutation::Unchanged);
    assert_eq!(store.append_older(&c1(), vec![post("p1", "c1", 10)], true), Mutation::Unchanged);
    assert_eq!(ids(&store.channel_posts(&c1())), vec!["p2"]);

    let err = store
        .apply_delete(&PostId::from("missing"), at(40))
        .expect_err("unknown");
    assert!(err.is_conflict());
}

#[test]
fn deleted_root_with_replies_stays_as_tombstone() {
    let mut store = PostStore::new();
    let mut root = post("root", "c1", 1);
    root.reply_count = 2;
    store.append_older(&c1(), vec![root.clone()], true);
    load_thread(
        &mut store,
        root,
        vec![reply("a", "c1", "root", 2), reply("b", "c1", "root", 3)],
    );
    let root_id = PostId::from("root");

    store.apply_delete(&root_id, at(10)).expect("deleted");
    assert_eq!(ids(&store.channel_posts(&c1())), vec!["root"]);
    let view = store.thread(&root_id).expect("thread");
    assert_eq!(ids(&view.posts), vec!["root", "a", "b"]);
    assert!(view.posts[0].is_deleted());

    store.apply_delete(&PostId::from("a"), at(11)).expect("a deleted");
    assert!(store.thread(&root_id).is_some());

    store.apply_delete(&PostId::from("b"), at(12)).expect("b deleted");
    assert!(store.thread(&root_id).is_none());
    assert!(store.channel_posts(&c1()).is_empty());
}

#[test]
fn live_replies_bump_root_count() {
    let mut store = PostStore::new();
    load_thread(&mut store, post("root", "c1", 1), Vec::new());

    store.receive_post(reply("a", "c1", "root", 2));
    store.receive_post(reply("a", "c1", "root", 2));
    let mut deleted = reply("b", "c1", "root", 3);
    deleted.deleted_at = Some(at(4));
    store.receive_post(deleted);

    assert_eq!(store.post(&key("root")).map(|root| root.reply_count), Some(1));
    assert_eq!(ids(&store.channel_posts(&c1())), vec!["a"]);
}

#[test]
fn reactions_are_a_set() {
    let mut store = PostStore::new();
    store.receive_post(post("p1", "c1", 10));
    let tada = Reaction::new("p1", "tada", "alice");

    assert_eq!(store.apply_reaction_delta(&tada, true), Ok(Mutation::Applied));
    assert_eq!(store.apply_reaction_delta(&tada, true), Ok(Mutation::Unchanged));
    assert_eq!(store.post(&key("p1")).map(|p| p.reactions.len()), Some(1));

    assert_eq!(store.apply_reaction_delta(&tada, false), Ok(Mutation::Applied));
    assert_eq!(store.apply_reaction_delta(&tada, false), Ok(Mutation::Unchanged));

    let err = store
        .apply_reaction_delta(&Reaction::new("nope", "tada", "alice"), true)
        .expect_err("unknown post");
    assert!(err.is_conflict());

    store.apply_delete(&PostId::from("p1"), at(20)).expect("deleted");
    let err = store.apply_reaction_delta(&tada, true).expect_err("deleted post");
    assert!(err.is_conflict());
}

#[test]
fn page_fetched_before_a_reaction_keeps_it() {
    let mut store = PostStore::new();
    store.receive_post(post("p1", "c1", 10));
    let smile = Reaction::new("p1", "smile", "carol");
    store.apply_reaction_delta(&smile, true).expect("reaction");

    store.append_older(&c1(), vec![post("p1", "c1", 10)], true);
    assert!(store
        .post(&key("p1"))
        .is_some_and(|p| p.reactions.contains(&smile)));

    let mut edited = post("p1", "c1", 10);
    edited.updated_at = at(40);
    store.append_older(&c1(), vec![edited], true);
    assert!(store
        .post(&key("p1"))
        .is_some_and(|p| p.reactions.is_empty()));
}

#[test]
fn thread_load_state_transitions() {
    let mut store = PostStore::new();
    let root_id = PostId::from("root");

    assert_eq!(store.begin_thread_load(&root_id), Mutation::Applied);
    assert_eq!(store.begin_thread_load(&root_id), Mutation::Unchanged);
    assert!(store.thread(&root_id).expect("thread").thread.loading);

    store.fail_thread_load(&root_id, ApiError::unavailable("offline"));
    let view = store.thread(&root_id).expect("thread");
    assert!(!view.thread.loading);
    assert!(view.thread.error.is_some());

    store.begin_thread_load(&root_id);
    store.complete_thread_load(
        &root_id,
        Page {
            posts: vec![post("root", "c1", 1), reply("a", "c1", "root", 2), reply("z", "c1", "other", 3)],
            has_more: true,
        },
    );
    let view = store.thread(&root_id).expect("thread");
    assert_eq!(ids(&view.posts), vec!["root", "a"]);
    assert!(view.thread.has_more);
    assert_eq!(view.thread.error, None);
    assert!(store.channel_posts(&c1()).is_empty());
}

#[test]
fn thread_opened_later_includes_earlier_replies() {
    let mut store = PostStore::new();
    store.append_older(&c1(), vec![post("r", "c1", 10)], true);
    store.create_optimistic(draft("x", "c1", Some("r"), 11));
    store.receive_post(reply("a", "c1", "r", 12));
    let mut gone = reply("d", "c1", "r", 13);
    gone.deleted_at = Some(at(14));
    store.receive_post(gone);

    load_thread(&mut store, post("r", "c1", 10), Vec::new());

    let view = store.thread(&PostId::from("r")).expect("thread");
    assert_eq!(ids(&view.posts), vec!["r", "x", "a"]);
    assert_eq!(view.thread.post_ids[1], PostKey::Pending(TempId::from("x")));
}

#[test]
fn removing_a_channel_drops_its_posts() {
    let mut store = PostStore::new();
    store.append_older(&c1(), vec![post("p1", "c1", 10)], true);
    store.receive_post(post("q1", "c2", 10));

    assert_eq!(store.remove_channel(&c1()), Mutation::Applied);
    assert_eq!(store.remove_channel(&c1()), Mutation::Unchanged);
    assert!(store.post(&key("p1")).is_none());
    assert!(store.post(&key("q1")).is_some());
}

#[test]
fn handler_only_removes_channel_for_local_user() {
    let store = Arc::new(RwLock::new(PostStore::new()));
    store.write().receive_post(post("p1", "c1", 10));
    let handler = PostEvents::new(Arc::clone(&store), UserId::from("alice"));
    let removal = |user: &str| {
        DecodedEvent::new(
            EventKind::UserRemoved,
            EventPayload::Membership {
                channel_id: c1(),
                user_id: UserId::from(user),
            },
        )
    };

    assert_eq!(handler.handle(&removal("bob")), Ok(Mutation::Unchanged));
    assert!(store.read().post(&key("p1")).is_some());
    assert_eq!(handler.handle(&removal("alice")), Ok(Mutation::Applied));
    assert!(store.read().post(&key("p1")).is_none());
}

#[test]
fn handler_applies_edit_and_delete_events() {
    let store = Arc::new(RwLock::new(PostStore::new()));
    store.write().receive_post(post("p1", "c1", 10));
    let handler = PostEvents::new(Arc::clone(&store), UserId::from("alice"));

    let mut edited = post("p1", "c1", 10);
    edited.message = "edited".to_string();
    edited.updated_at = at(20);
    let event = DecodedEvent::new(
        EventKind::PostEdited,
        EventPayload::Post {
            post: edited.clone(),
            channel_kind: None,
        },
    );
    assert_eq!(handler.handle(&event), Ok(Mutation::Applied));

    edited.deleted_at = Some(at(30));
    let event = DecodedEvent::new(
        EventKind::PostDeleted,
        EventPayload::Post {
            post: edited,
            channel_kind: None,
        },
    );
    assert_eq!(handler.handle(&event), Ok(Mutation::Applied));
    assert!(store.read().channel_posts(&c1()).is_empty());
}

#[derive(Debug, Clone)]
enum StoreOp {
    Push(u8),
    Older(u8),
    Newer(u8),
    Send(u8, i64),
    Confirm(u8, i64),
    Fail(u8),
}

fn store_op() -> impl Strategy<Value = StoreOp> {
    prop_oneof![
        (0u8..20).prop_map(StoreOp::Push),
        (0u8..20).prop_map(StoreOp::Older),
        (0u8..20).prop_map(StoreOp::Newer),
        (0u8..6, 0i64..40).prop_map(|(temp, ms)| StoreOp::Send(temp, ms)),
        (0u8..6, 0i64..40).prop_map(|(temp, ms)| StoreOp::Confirm(temp, ms)),
        (0u8..6).prop_map(StoreOp::Fail),
    ]
}

fn page_post(index: u8) -> Post {
    post(&format!("p{index}"), "c1", i64::from(index) * 7 % 23)
}

fn temp(index: u8) -> TempId {
    TempId::from(format!("t{index}"))
}

proptest! {
    #[test]
    fn sequence_stays_sorted_and_unique(ops in prop::collection::vec(store_op(), 1..80)) {
        let mut store = PostStore::new();
        let mut delivered = std::collections::BTreeSet::new();
        let mut confirmed = Vec::new();
        for op in ops {
            match op {
                StoreOp::Push(index) => {
                    delivered.insert(index);
                    store.receive_post(page_post(index));
                }
                StoreOp::Older(index) => {
                    delivered.insert(index);
                    store.append_older(&c1(), vec![page_post(index)], true);
                }
                StoreOp::Newer(index) => {
                    delivered.insert(index);
                    store.append_newer(&c1(), vec![page_post(index)], false);
                }
                StoreOp::Send(index, ms) => {
                    store.create_optimistic(draft(&format!("t{index}"), "c1", None, ms));
                }
                StoreOp::Confirm(index, ms) => {
                    let temp_id = temp(index);
                    if store.post(&PostKey::Pending(temp_id.clone())).is_none() {
                        continue;
                    }
                    let mut server = post(&format!("s{index}"), "c1", ms);
                    server.pending_post_id = Some(temp_id.clone());
                    server.user_id = UserId::from("alice");
                    prop_assert!(store.confirm_create(&temp_id, server).is_ok());
                    confirmed.push(temp_id);
                }
                StoreOp::Fail(index) => {
                    store.fail_create(&temp(index));
                }
            }
        }

        let posts = store.channel_posts(&c1());
        let keys = posts
            .iter()
            .map(|post| post.id.clone())
            .collect::<std::collections::HashSet<_>>();
        prop_assert_eq!(keys.len(), posts.len());
        for pair in posts.windows(2) {
            let left = (pair[0].created_at, pair[0].id.as_str());
            let right = (pair[1].created_at, pair[1].id.as_str());
            prop_assert!(left < right);
        }
        for index in delivered {
            let delivered_key = key(&format!("p{index}"));
            prop_assert!(keys.contains(&delivered_key));
        }
        for temp_id in &confirmed {
            prop_assert!(!keys.contains(&PostKey::Pending(temp_id.clone())));
            prop_assert!(store.find_post(temp_id).is_some_and(|post| !post.is_pending()));
        }
    }
}

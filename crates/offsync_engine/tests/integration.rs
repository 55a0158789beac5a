//! End-to-end reconciliation flows over in-memory stores.

use offsync_engine::{Event, MockRemoteStore, Model, ModelConfig, RemoteControl};
use offsync_store::{
    Expr, FieldSpec, FieldType, Filter, ListModifiers, LocalId, MemoryStore, Patch, Record,
    RemoteId, RemoveTarget, Schema, Value,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn player_schema() -> Schema {
    Schema::new()
        .with_field("name", FieldSpec::required(FieldType::Text))
        .with_field("score", FieldSpec::optional(FieldType::Int).with_default(0i64))
}

fn new_model(online: bool) -> (Model, RemoteControl) {
    init_tracing();
    let (remote, control) = MockRemoteStore::new();
    let mut config = ModelConfig::new("players").schema(player_schema());
    if !online {
        config = config.offline();
    }
    let mut model = Model::new(config, Box::new(MemoryStore::new()), Box::new(remote));
    model.init().unwrap();
    (model, control)
}

fn player(name: &str, score: i64) -> Record {
    Record::new().with_field("name", name).with_field("score", score)
}

#[test]
fn offline_create_syncs_on_reconnect() {
    let (mut model, control) = new_model(false);

    let saved = model.save(player("alice", 10)).unwrap().done().unwrap();
    let local = saved.local_id.unwrap();
    assert!(saved.meta.dirty);
    assert!(control.rows().is_empty());
    assert_eq!(model.pending_creates(), 1);

    // the mirror answers reads while the remote is unreachable
    let found = model.find_by_local(local).unwrap().done().unwrap().unwrap();
    assert_eq!(found.field("name"), Some(&Value::Text("alice".into())));

    model.set_online(true);
    model.run_until_idle().unwrap();

    assert!(!model.has_pending());
    let rows = control.rows();
    assert_eq!(rows.len(), 1);
    let remote = rows[0].remote_id.unwrap();

    // the acknowledged entity is addressable by its remote identity and
    // keeps the local identity it was born with
    let found = model.find(remote).unwrap().done().unwrap().unwrap();
    assert_eq!(found.local_id, Some(local));
    assert_eq!(found.field("score"), Some(&Value::Int(10)));
}

#[test]
fn bulk_patch_queued_offline_replays_once_online() {
    let (mut model, control) = new_model(true);
    for (name, score) in [("a", 1i64), ("b", 2), ("c", 3)] {
        model.save(player(name, score)).unwrap();
    }
    assert_eq!(control.rows().len(), 3);

    model.set_online(false);
    let patch = Patch::new().expr("score", Expr::parse("score + 10").unwrap());
    let count = model
        .update_all(&patch, &Filter::all())
        .unwrap()
        .done()
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(model.pending_patches(), 1);

    // the remote rows are untouched until reconnect
    assert!(control
        .rows()
        .iter()
        .all(|r| r.field("score").unwrap().as_int().unwrap() < 10));

    let updates_before = control.calls().updates;
    model.set_online(true);
    model.run_until_idle().unwrap();

    assert_eq!(model.pending_patches(), 0);
    // one remote call replays the whole patch, and the flushed count
    // surfaces as an event
    assert_eq!(control.calls().updates, updates_before + 1);
    let events = model.poll_events();
    assert!(events.iter().any(|e| matches!(e, Event::Updated(3))));
    let mut scores: Vec<i64> = control
        .rows()
        .iter()
        .map(|r| r.field("score").unwrap().as_int().unwrap())
        .collect();
    scores.sort_unstable();
    assert_eq!(scores, vec![11, 12, 13]);
}

#[test]
fn offline_removals_consolidate_into_one_remote_call() {
    let (mut model, control) = new_model(true);
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let saved = model.save(player(name, 0)).unwrap().done().unwrap();
        ids.push(saved.remote_id.unwrap());
    }

    model.set_online(false);
    model.remove(RemoveTarget::Id(ids[0])).unwrap();
    model.remove(RemoveTarget::Id(ids[1])).unwrap();

    // soft-deleted mirrors disappear from offline lists
    let listed = model
        .list(&Filter::all(), &ListModifiers::default())
        .unwrap()
        .done()
        .unwrap();
    assert_eq!(listed.len(), 1);

    let removes_before = control.calls().removes;
    model.set_online(true);
    model.run_until_idle().unwrap();

    assert_eq!(control.calls().removes, removes_before + 1);
    assert_eq!(control.rows().len(), 1);
    let events = model.poll_events();
    assert!(events.iter().any(|e| matches!(e, Event::Removed(2))));

    // tombstones survive the drain: the removed ids stay unreachable
    assert_eq!(model.find(ids[0]).unwrap().done().unwrap(), None);
    assert_eq!(model.find(ids[1]).unwrap().done().unwrap(), None);
}

#[test]
fn three_offline_creates_resolve_identities_in_one_drain() {
    let (mut model, control) = new_model(false);
    let mut locals = Vec::new();
    for name in ["a", "b", "c"] {
        let saved = model.save(player(name, 0)).unwrap().done().unwrap();
        locals.push((name.to_owned(), saved.local_id.unwrap()));
    }
    assert_eq!(model.pending_creates(), 3);

    model.set_online(true);
    model.run_until_idle().unwrap();

    assert!(!model.has_pending());
    assert_eq!(model.stats().creates_dispatched, 3);
    let rows = control.rows();
    assert_eq!(rows.len(), 3);

    // every drained create resolved to its own remote identity and
    // kept the local identity it was born with
    for row in rows {
        let remote = row.remote_id.unwrap();
        let name = row.field("name").unwrap().as_text().unwrap().to_owned();
        let found = model.find(remote).unwrap().done().unwrap().unwrap();
        let expected = locals.iter().find(|(n, _)| *n == name).unwrap().1;
        assert_eq!(found.local_id, Some(expected));
    }
}

#[test]
fn reconnect_with_empty_queues_is_a_noop() {
    let (mut model, control) = new_model(true);
    let saved = model.save(player("ana", 1)).unwrap().done().unwrap();
    let remote = saved.remote_id.unwrap();
    let calls = control.calls();

    model.set_online(false);
    model.set_online(true);
    model.run_until_idle().unwrap();

    // nothing to drain: no tick runs and the remote store sees no
    // further writes
    assert_eq!(model.stats().ticks, 0);
    assert_eq!(control.calls().saves, calls.saves);
    assert_eq!(control.calls().updates, calls.updates);
    assert_eq!(control.calls().removes, calls.removes);

    // the accepted write still answers reads unchanged
    let found = model.find(remote).unwrap().done().unwrap().unwrap();
    assert_eq!(found.field("name"), Some(&Value::Text("ana".into())));
    assert_eq!(found.field("score"), Some(&Value::Int(1)));
}

#[test]
fn restart_rebuilds_queues_from_dirty_mirrors() {
    init_tracing();

    // local rows left behind by an interrupted session
    let mut unsynced = player("new", 1);
    unsynced.local_id = Some(LocalId(1));
    unsynced.meta.dirty = true;
    unsynced.meta.stamp = 100;

    let mut edited = player("edited", 2);
    edited.local_id = Some(LocalId(2));
    edited.remote_id = Some(RemoteId(11));
    edited.meta.dirty = true;
    edited.meta.stamp = 100;

    let mut deleted = player("gone", 3);
    deleted.local_id = Some(LocalId(3));
    deleted.remote_id = Some(RemoteId(12));
    deleted.meta.deleted = true;
    deleted.meta.dirty = true;
    deleted.meta.stamp = 100;

    let local = MemoryStore::with_rows(vec![unsynced, edited, deleted]);
    let (remote, control) = MockRemoteStore::new();
    for (id, name) in [(11u64, "old"), (12, "doomed")] {
        let mut row = player(name, 0);
        row.remote_id = Some(RemoteId(id));
        control.seed(row);
    }

    let mut model = Model::new(
        ModelConfig::new("players").schema(player_schema()).offline(),
        Box::new(local),
        Box::new(remote),
    );
    model.init().unwrap();

    assert_eq!(model.pending_creates(), 1);
    assert_eq!(model.pending_updates(), 1);

    model.set_online(true);
    model.run_until_idle().unwrap();

    assert!(!model.has_pending());
    assert_eq!(control.rows().len(), 2);
    assert!(control.row(RemoteId(12)).is_none());
    assert_eq!(
        control.row(RemoteId(11)).unwrap().field("name"),
        Some(&Value::Text("edited".into()))
    );
}

#[test]
fn stale_remote_reads_are_discarded() {
    init_tracing();
    let (remote, control) = MockRemoteStore::new();
    // no freshness window: every online find consults the remote store
    let mut model = Model::new(
        ModelConfig::new("players")
            .schema(player_schema())
            .timeout(None),
        Box::new(MemoryStore::new()),
        Box::new(remote),
    );
    model.init().unwrap();

    let saved = model.save(player("current", 5)).unwrap().done().unwrap();
    let id = saved.remote_id.unwrap();

    // the remote row is replaced behind the model's back, carrying a
    // stamp older than the accepted local write
    let mut shadow = player("ancient", 0);
    shadow.remote_id = Some(id);
    control.seed(shadow);
    control.set_row_stamp(id, 1);

    let found = model.find(id).unwrap().done().unwrap().unwrap();
    assert_eq!(found.field("name"), Some(&Value::Text("current".into())));

    // a genuinely newer remote write is taken and mirrored
    let mut fresh = player("newest", 9);
    fresh.remote_id = Some(id);
    control.seed(fresh);
    control.set_row_stamp(id, u64::MAX);

    let found = model.find(id).unwrap().done().unwrap().unwrap();
    assert_eq!(found.field("name"), Some(&Value::Text("newest".into())));
}

#[test]
fn online_list_reconciles_into_the_mirror() {
    let (mut model, control) = new_model(true);
    for name in ["a", "b"] {
        control.seed(player(name, 0));
    }

    let listed = model
        .list(&Filter::all(), &ListModifiers::default())
        .unwrap()
        .done()
        .unwrap();
    assert_eq!(listed.len(), 2);

    // the page is now mirrored and answers reads offline
    model.set_online(false);
    let offline = model
        .list(&Filter::all(), &ListModifiers::default())
        .unwrap()
        .done()
        .unwrap();
    assert_eq!(offline.len(), 2);
}

#[test]
fn empty_remote_page_purges_clean_mirrors() {
    let (mut model, control) = new_model(true);
    let saved = model.save(player("temp", 0)).unwrap().done().unwrap();
    let id = saved.remote_id.unwrap();

    // another client removed the row
    assert!(control.remove_row(id));

    let listed = model
        .list(&Filter::all(), &ListModifiers::default())
        .unwrap()
        .done()
        .unwrap();
    assert!(listed.is_empty());

    // the clean mirror is gone too
    let local = saved.local_id.unwrap();
    assert_eq!(model.find_by_local(local).unwrap().done().unwrap(), None);
}

#[test]
fn deferred_reads_surface_as_events() {
    let (mut model, control) = new_model(true);
    control.seed(player("a", 0));
    control.set_defer(true);

    let outcome = model
        .list(&Filter::all(), &ListModifiers::default())
        .unwrap();
    assert!(outcome.is_pending());
    assert!(model.poll_events().is_empty());

    control.complete_all();
    model.run_until_idle().unwrap();

    let events = model.poll_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Listed(rows) if rows.len() == 1)));
}

#[test]
fn remove_everything_offline_then_drain() {
    let (mut model, control) = new_model(true);
    for name in ["a", "b"] {
        model.save(player(name, 0)).unwrap();
    }
    // one row that never reached the remote store
    model.set_online(false);
    model.save(player("c", 0)).unwrap();

    let count = model.remove(RemoveTarget::All).unwrap().done().unwrap();
    assert_eq!(count, 3);

    let listed = model
        .list(&Filter::all(), &ListModifiers::default())
        .unwrap()
        .done()
        .unwrap();
    assert!(listed.is_empty());

    model.set_online(true);
    model.run_until_idle().unwrap();
    assert!(control.rows().is_empty());
}

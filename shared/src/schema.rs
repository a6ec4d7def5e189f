diesel::table! {
    outbox_events (id) {
        id -> Int8,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        payload -> Jsonb,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    inbox_events (id) {
        id -> Int8,
        event_id -> Varchar,
        event_type -> Varchar,
        payload -> Jsonb,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    outbox_events,
    inbox_events,
);

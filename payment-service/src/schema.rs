diesel::table! {
    payment_accounts (id) {
        id -> Uuid,
        user_id -> Uuid,
        balance -> Numeric,
        active -> Bool,
        version -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    payment_transactions (order_id) {
        order_id -> Uuid,
        user_id -> Uuid,
        amount -> Numeric,
        result -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    payment_accounts,
    payment_transactions,
);

diesel::table! {
    products (id) {
        id -> Uuid,
        name -> Varchar,
        price -> Numeric,
        stock -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    product_holds (id) {
        id -> Uuid,
        order_id -> Uuid,
        product_id -> Uuid,
        quantity -> Int4,
        unit_price -> Numeric,
        total_price -> Numeric,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_reservations (order_id) {
        order_id -> Uuid,
        outcome -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(product_holds -> products (product_id));

diesel::allow_tables_to_appear_in_same_query!(
    products,
    product_holds,
    order_reservations,
);

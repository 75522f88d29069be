diesel::table! {
    rental_companies (id) {
        id -> Int8,
        name -> Varchar,
        deleted -> Bool,
    }
}

diesel::table! {
    rental_locations (id) {
        id -> Int8,
        company_id -> Int8,
        name -> Varchar,
        city -> Varchar,
        deleted -> Bool,
    }
}

diesel::table! {
    car_models (id) {
        id -> Int8,
        brand -> Varchar,
        name -> Varchar,
    }
}

diesel::table! {
    clients (id) {
        id -> Int8,
        full_name -> Varchar,
        email -> Varchar,
        deleted -> Bool,
    }
}

diesel::table! {
    cars (id) {
        id -> Int8,
        version -> Int8,
        company_id -> Int8,
        model_id -> Int8,
        current_location_id -> Nullable<Int8>,
        status -> Varchar,
        plate_number -> Varchar,
        mileage_km -> Int4,
        daily_price_cents -> Int8,
        deleted -> Bool,
    }
}

diesel::table! {
    bookings (id) {
        id -> Int8,
        version -> Int8,
        client_id -> Int8,
        car_id -> Int8,
        pickup_location_id -> Int8,
        return_location_id -> Int8,
        pickup_time -> Timestamptz,
        return_time -> Timestamptz,
        status -> Varchar,
        total_price_cents -> Int8,
        currency -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Int8,
        aggregate_type -> Varchar,
        aggregate_id -> Varchar,
        event_type -> Varchar,
        event_data -> Jsonb,
        status -> Varchar,
        retry_count -> Int4,
        error_message -> Nullable<Text>,
        created_at -> Timestamptz,
        claimed_at -> Nullable<Timestamptz>,
        processed_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(bookings -> cars (car_id));
diesel::joinable!(bookings -> clients (client_id));
diesel::joinable!(cars -> car_models (model_id));
diesel::joinable!(cars -> rental_companies (company_id));
diesel::joinable!(cars -> rental_locations (current_location_id));
diesel::joinable!(rental_locations -> rental_companies (company_id));

diesel::allow_tables_to_appear_in_same_query!(
    bookings,
    car_models,
    cars,
    clients,
    outbox_events,
    rental_companies,
    rental_locations,
);

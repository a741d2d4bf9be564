diesel::table! {
    devices (id) {
        id -> Integer,
        name -> Text,
        address -> Text,              // host or host:port
        secret_ref -> Nullable<Text>, // key into the external secret store
        active -> Bool,
        created_at -> Timestamp,
    }
}

diesel::table! {
    device_status (device_id) {
        device_id -> Integer,
        reachable -> Bool,
        power_state -> Text,          // on | off | warming | cooling | standby | unknown
        input -> Nullable<Text>,
        lamp_info -> Nullable<Text>,  // JSON
        error_info -> Nullable<Text>, // JSON
        consecutive_failures -> Integer,
        last_error -> Nullable<Text>,
        checked_at -> Timestamp,
    }
}

diesel::table! {
    schedules (id) {
        id -> Integer,
        name -> Nullable<Text>,
        action -> Text,               // on | off
        run_at -> Timestamp,
        anchor_at -> Timestamp,
        occurrence -> Integer,
        status -> Text,               // pending | running | completed | failed | skipped
        enabled -> Bool,
        recurrence -> Text,           // none | hourly | daily | weekly | monthly | yearly
        target_mode -> Text,          // all | selection
        result -> Nullable<Text>,
        last_outcome -> Nullable<Text>,
        created_at -> Timestamp,
        completed_at -> Nullable<Timestamp>,
        claimed_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    schedule_targets (schedule_id, device_id) {
        schedule_id -> Integer,
        device_id -> Integer,
    }
}

diesel::table! {
    blackout_windows (id) {
        id -> Integer,
        name -> Text,
        start_at -> Timestamp,
        end_at -> Timestamp,
        block_action -> Text,         // on | off | both
    }
}

diesel::table! {
    audit_log (id) {
        id -> Integer,
        device_id -> Nullable<Integer>,
        device_name -> Nullable<Text>, // snapshot, survives device removal
        action -> Text,
        initiated_by -> Text,          // user | schedule | system
        initiator_ref -> Nullable<Text>,
        success -> Bool,
        error_kind -> Nullable<Text>,
        message -> Text,
        created_at -> Timestamp,
    }
}

diesel::table! {
    engine_settings (id) {
        id -> Integer,
        dispatch_interval_secs -> BigInt,
        poll_interval_secs -> BigInt,
        unreachable_threshold -> Integer,
        device_timeout_secs -> BigInt,
        max_concurrent_devices -> Integer,
        claim_lease_secs -> BigInt,
        shutdown_grace_secs -> BigInt,
        skipped_one_shot_is_final -> Bool,
        skip_missed_occurrences -> Bool,
        skip_if_already_in_state -> Bool,
    }
}

diesel::joinable!(device_status -> devices (device_id));
diesel::joinable!(schedule_targets -> devices (device_id));
diesel::joinable!(schedule_targets -> schedules (schedule_id));

diesel::allow_tables_to_appear_in_same_query!(
    devices,
    device_status,
    schedules,
    schedule_targets,
    blackout_windows,
    audit_log,
    engine_settings,
);

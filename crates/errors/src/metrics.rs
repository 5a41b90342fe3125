use metrics::register_node_counter;

register_node_counter!(pub LOCK_CONFLICT_ERROR_TOTAL, "Count of lock conflict errors");
register_node_counter!(
    pub INSUFFICIENT_REPLICAS_ERROR_TOTAL,
    "Count of commits rejected for lack of replica acknowledgements"
);
register_node_counter!(pub NOT_LEADER_ERROR_TOTAL, "Count of writes attempted on a replica");
register_node_counter!(
    pub ENVIRONMENT_INVALID_ERROR_TOTAL,
    "Count of operations against an invalidated storage environment"
);

pub mod keys {
    //! Cache keys

    pub const WORK_QUEUE: &str = "fleet:requests:queue"; // List
    pub const DEDUPE: &str = "fleet:requests:dedupe"; // String prefix
    pub const CRAWLER: &str = "fleet:crawler"; // String prefix, TTL
    pub const STORE_CRAWLERS: &str = "fleet:store"; // Sorted set prefix
    pub const STORES: &str = "fleet:stores"; // Sorted set

    pub fn dedupe(request_id: &str) -> String {
        format!("{DEDUPE}:{request_id}")
    }

    pub fn crawler(crawler_id: &str) -> String {
        format!("{CRAWLER}:{crawler_id}")
    }

    pub fn store_crawlers(store_id: &str) -> String {
        format!("{STORE_CRAWLERS}:{store_id}:crawlers")
    }
}

pub mod topics {
    //! Broker topics

    pub const REQUEST: &str = "fleet.request";
    pub const ITEM: &str = "fleet.item";
    pub const ERROR: &str = "fleet.error";
    pub const STATUS: &str = "fleet.status";

    pub const STORE_CHANNEL: &str = "control"; // Channel of per-store consumers

    pub fn store_request(store_id: &str) -> String {
        format!("fleet.store.{store_id}.request")
    }
}

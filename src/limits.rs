/// Quotas a single tenant may hold.
pub const MAX_QUOTAS_PER_TENANT: usize = 100_000;

/// Ceiling for both `capacity` and `overbooking_limit`, so `reserved` always fits in a `u32`.
pub const MAX_CAPACITY: u32 = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PRODUCT_TYPE_LEN: usize = 64;
pub const MAX_RESERVATION_REF_LEN: usize = 128;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

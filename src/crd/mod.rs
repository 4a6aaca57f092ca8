mod patroni_postgres;

pub use patroni_postgres::*;

use std::error::Error;
use std::result::Result;

fn main() -> Result<(), Box<dyn Error>> {
    tonic_build::configure().compile(
        &[
            "proto/kv.proto",
            "proto/watch.proto",
            "proto/lease.proto",
            "proto/maintenance.proto",
            "proto/cluster.proto",
            "proto/auth.proto",
        ],
        &["proto"],
    )?;
    Ok(())
}

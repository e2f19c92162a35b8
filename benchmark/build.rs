fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().compile(
        &["../kvserver/proto/kvservice.proto"],
        &["../kvserver/proto"],
    )?;
    Ok(())
}

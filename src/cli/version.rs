/// Display version information
pub fn execute() {
    println!("vaultd {}", env!("CARGO_PKG_VERSION"));
    println!("Operator CLI for a vault in a content-addressed storage network");
}

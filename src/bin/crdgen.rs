use fleetplane::crd::{ClusterBackupStorageLocation, Machine};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Machine::crd())?);
    println!("---");
    print!(
        "{}",
        serde_yaml::to_string(&ClusterBackupStorageLocation::crd())?
    );
    Ok(())
}

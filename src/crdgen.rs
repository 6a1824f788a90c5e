use kube::CustomResourceExt;

use modelbox_controller::crd::ModelBox;

fn main() -> Result<(), serde_yaml::Error> {
    let crd = serde_yaml::to_string(&ModelBox::crd())?;
    println!("{crd}");
    Ok(())
}

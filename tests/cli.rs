use predicates::prelude::*;

fn carapace() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("carapace").unwrap()
}

#[test]
fn help_works() {
    carapace()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Ephemeral VM pool"));
}

#[test]
fn run_without_image_fails_with_usage_error() {
    carapace()
        .args(["run", "echo hi"])
        .env_remove("CARAPACE_IMAGE")
        .env_remove("IMAGE_PATH")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no base image"));
}

#[test]
fn seed_subcommand_writes_a_valid_iso() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("id.pub");
    std::fs::write(
        &key_path,
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITESTKEY test@host\n",
    )
    .unwrap();
    let out = dir.path().join("seed.iso");

    carapace()
        .args(["seed", "--key"])
        .arg(&key_path)
        .arg("--out")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote seed ISO"));

    let iso = std::fs::read(&out).unwrap();
    assert_eq!(&iso[16 * 2048 + 1..16 * 2048 + 6], b"CD001");
    assert_eq!(&iso[16 * 2048 + 40..16 * 2048 + 46], b"CIDATA");
}

#[test]
fn seed_requires_a_key_argument() {
    carapace().arg("seed").assert().failure();
}

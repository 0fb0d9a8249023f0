use assert_cmd::Command;

#[test]
fn missing_arguments_is_an_error() {
    let mut cmd = Command::cargo_bin("pcap-udpify").expect("binary built");
    cmd.assert().failure();
}

#[test]
fn help_names_the_arguments() {
    let mut cmd = Command::cargo_bin("pcap-udpify").expect("binary built");
    let output = cmd.arg("--help").output().expect("run --help");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("INPUT"));
    assert!(stdout.contains("OUTPUT"));
}

#[test]
fn nonexistent_input_is_an_error() {
    let mut cmd = Command::cargo_bin("pcap-udpify").expect("binary built");
    cmd.args(["/nonexistent/input.pcap", "/tmp/out.pcap"])
        .assert()
        .failure();
}

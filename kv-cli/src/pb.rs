pub mod etcdserverpb {
    tonic::include_proto!("etcdserverpb");
}
